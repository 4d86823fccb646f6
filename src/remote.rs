use std::fs::File;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::GenodexError;

/// Read-only view of the remote annotation file server.
pub trait RemoteFiles: Send + Sync {
    /// File names directly under `dir` (no path prefix). A missing directory
    /// lists as empty.
    fn list(&self, dir: &str) -> Result<Vec<String>, GenodexError>;
    fn download(&self, path: &str, destination: &Path) -> Result<(), GenodexError>;
}

#[derive(Clone)]
pub struct HttpFileServer {
    client: Client,
    base_url: String,
}

impl HttpFileServer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GenodexError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("genodex/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GenodexError::RemoteHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| GenodexError::RemoteHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, GenodexError> {
        self.client.get(url).send().map_err(map_request_error)
    }
}

impl RemoteFiles for HttpFileServer {
    fn list(&self, dir: &str) -> Result<Vec<String>, GenodexError> {
        let url = format!("{}/", self.url(dir).trim_end_matches('/'));
        let response = self.get(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = handle_status(response)?;
        let body = response.text().map_err(map_request_error)?;
        Ok(parse_listing(&body))
    }

    fn download(&self, path: &str, destination: &Path) -> Result<(), GenodexError> {
        let response = self.get(&self.url(path))?;
        let mut response = handle_status(response)?;
        let mut file =
            File::create(destination).map_err(|err| GenodexError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file).map_err(|err| {
            if is_connection_io_error(&err) {
                GenodexError::RemoteConnect(err.to_string())
            } else {
                GenodexError::Filesystem(err.to_string())
            }
        })?;
        Ok(())
    }
}

fn handle_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, GenodexError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "remote request failed".to_string());
    Err(GenodexError::RemoteStatus { status, message })
}

fn map_request_error(err: reqwest::Error) -> GenodexError {
    if err.is_connect() || err.is_timeout() {
        GenodexError::RemoteConnect(err.to_string())
    } else {
        GenodexError::RemoteHttp(err.to_string())
    }
}

fn is_connection_io_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
    )
}

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*"([^"?#]+)""#).expect("href pattern is valid")
});

/// Accepts an autoindex-style HTML page or a plain one-name-per-line listing.
pub fn parse_listing(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    let hrefs: Vec<&str> = HREF
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    let candidates: Box<dyn Iterator<Item = &str>> = if hrefs.is_empty() {
        Box::new(body.lines())
    } else {
        Box::new(hrefs.into_iter())
    };
    for candidate in candidates {
        let trimmed = candidate.trim().trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
        if name.is_empty() || name == "." || name == ".." || name.contains(':') {
            continue;
        }
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    names
}
