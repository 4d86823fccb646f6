use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::GenodexError;

/// One data line of a delimited file, addressed by normalized header name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: HashMap<String, String>,
    line: u64,
    defect: Option<&'static str>,
}

impl Row {
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (normalize_header(key), value.to_string()))
                .collect(),
            line: 0,
            defect: None,
        }
    }

    /// Trimmed, non-blank value of `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(&normalize_header(column))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty() && !is_null_token(value))
    }

    /// First non-blank value among alias column names.
    pub fn first_of(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|alias| self.get(alias))
    }

    pub fn flag(&self, aliases: &[&str]) -> Option<bool> {
        self.first_of(aliases).and_then(parse_flag)
    }

    pub fn number(&self, aliases: &[&str]) -> Option<f64> {
        self.first_of(aliases)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }

    pub fn integer(&self, aliases: &[&str]) -> Option<i64> {
        self.first_of(aliases).and_then(|value| {
            value
                .parse::<i64>()
                .ok()
                .or_else(|| value.parse::<f64>().ok().map(|v| v as i64))
        })
    }

    /// 1-based line number in the source file, header included.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Why the line could not be read as a row, if it could not.
    pub fn defect(&self) -> Option<&'static str> {
        self.defect
    }
}

fn is_null_token(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "na" | "nan" | "null" | "none")
}

pub fn normalize_header(name: &str) -> String {
    name.trim()
        .trim_start_matches('\u{feff}')
        .trim_matches('"')
        .trim()
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
}

/// `true/t/1/y/yes` and `false/f/0/n/no`, case-insensitive.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "y" | "yes" => Some(true),
        "false" | "f" | "0" | "n" | "no" => Some(false),
        _ => None,
    }
}

pub const INVALID_ENCODING: &str = "invalid encoding";

/// Splits one record on `delimiter`. A field opening with `"` runs to the
/// matching quote, delimiters included; `""` inside it is a literal quote.
pub fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            }
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ch if ch == delimiter && !quoted => fields.push(std::mem::take(&mut field)),
            ch => field.push(ch),
        }
    }
    fields.push(field);
    fields
}

/// Streams a tab- or comma-delimited file with a header line in chunks of rows.
pub struct DelimitedReader {
    path: PathBuf,
    lines: Box<dyn BufRead>,
    headers: Vec<String>,
    delimiter: char,
    line: u64,
}

impl DelimitedReader {
    pub fn open(path: &Path) -> Result<Self, GenodexError> {
        let file = File::open(path).map_err(|err| GenodexError::InputRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let is_gz = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let inner: Box<dyn Read> = if is_gz {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Self::from_reader(path, BufReader::new(inner))
    }

    pub fn from_reader<R: BufRead + 'static>(path: &Path, reader: R) -> Result<Self, GenodexError> {
        let mut reader = Self {
            path: path.to_path_buf(),
            lines: Box::new(reader),
            headers: Vec::new(),
            delimiter: '\t',
            line: 0,
        };
        let header = loop {
            match reader.next_line()? {
                Some((line, _)) if line.trim().is_empty() || line.starts_with('#') => continue,
                Some((line, _)) => break line,
                None => break String::new(),
            }
        };
        reader.delimiter = if header.contains('\t') { '\t' } else { ',' };
        reader.headers = split_record(&header, reader.delimiter)
            .iter()
            .map(|name| normalize_header(name))
            .collect();
        Ok(reader)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next line without its terminator, and whether it was valid UTF-8.
    /// Invalid bytes are replaced so one bad line never ends the stream.
    fn next_line(&mut self) -> Result<Option<(String, bool)>, GenodexError> {
        let mut buf = Vec::new();
        let read = self
            .lines
            .read_until(b'\n', &mut buf)
            .map_err(|err| GenodexError::InputRead {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        if read == 0 {
            return Ok(None);
        }
        self.line += 1;
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        match String::from_utf8(buf) {
            Ok(line) => Ok(Some((line, true))),
            Err(err) => Ok(Some((
                String::from_utf8_lossy(err.as_bytes()).into_owned(),
                false,
            ))),
        }
    }

    /// Up to `size` rows; an empty vector means the file is exhausted.
    pub fn next_chunk(&mut self, size: usize) -> Result<Vec<Row>, GenodexError> {
        let mut rows = Vec::with_capacity(size.min(4096));
        while rows.len() < size.max(1) {
            let Some((line, valid)) = self.next_line()? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if !valid {
                rows.push(Row {
                    values: HashMap::new(),
                    line: self.line,
                    defect: Some(INVALID_ENCODING),
                });
                continue;
            }
            let values = split_record(&line, self.delimiter)
                .into_iter()
                .zip(self.headers.iter())
                .map(|(value, header)| (header.clone(), value.trim().to_string()))
                .collect();
            rows.push(Row {
                values,
                line: self.line,
                defect: None,
            });
        }
        Ok(rows)
    }
}

/// Expands directories into their regular files (sorted, non-recursive).
/// Unreadable paths abort the run.
pub fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>, GenodexError> {
    let mut inputs = Vec::new();
    for path in paths {
        let metadata = fs::metadata(path).map_err(|err| GenodexError::InputRead {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if metadata.is_dir() {
            let entries = fs::read_dir(path).map_err(|err| GenodexError::InputRead {
                path: path.clone(),
                message: err.to_string(),
            })?;
            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|err| GenodexError::InputRead {
                    path: path.clone(),
                    message: err.to_string(),
                })?;
                let entry_path = entry.path();
                let hidden = entry_path
                    .file_name()
                    .map(|name| name.to_string_lossy().starts_with('.'))
                    .unwrap_or(true);
                if entry_path.is_file() && !hidden {
                    files.push(entry_path);
                }
            }
            files.sort();
            inputs.extend(files);
        } else {
            inputs.push(path.clone());
        }
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_vocabulary() {
        for value in ["true", "T", "1", "y", "YES"] {
            assert_eq!(parse_flag(value), Some(true), "{value}");
        }
        for value in ["false", "F", "0", "n", "No"] {
            assert_eq!(parse_flag(value), Some(false), "{value}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn header_names_are_tolerant() {
        let data = " Protein A ,protein_b\nP1,P2\n";
        let mut reader =
            DelimitedReader::from_reader(Path::new("mem.csv"), data.as_bytes()).unwrap();
        assert_eq!(reader.headers(), ["protein_a", "protein_b"]);
        let rows = reader.next_chunk(10).unwrap();
        assert_eq!(rows[0].get("PROTEIN_A"), Some("P1"));
        assert_eq!(rows[0].line(), 2);
    }

    #[test]
    fn quoted_delimiters_stay_in_their_field() {
        let data = "note,protein_a,protein_b\n\"ABC transporter, permease\",P1,P2\n\"say \"\"hi\"\"\",P3,P4\n";
        let mut reader =
            DelimitedReader::from_reader(Path::new("mem.csv"), data.as_bytes()).unwrap();
        let rows = reader.next_chunk(10).unwrap();
        assert_eq!(rows[0].get("note"), Some("ABC transporter, permease"));
        assert_eq!(rows[0].get("protein_a"), Some("P1"));
        assert_eq!(rows[0].get("protein_b"), Some("P2"));
        assert_eq!(rows[1].get("note"), Some("say \"hi\""));
        assert_eq!(rows[1].get("protein_a"), Some("P3"));
    }

    #[test]
    fn split_record_keeps_unquoted_fields() {
        assert_eq!(split_record("a\t b \t", '\t'), ["a", " b ", ""]);
        assert_eq!(split_record("x\"y,z", ','), ["x\"y", "z"]);
    }

    #[test]
    fn undecodable_lines_become_defective_rows() {
        let data: &'static [u8] = b"protein_a\tprotein_b\tnote\nP1\tP2\tok\nP3\tP4\tcaf\xE9\nP5\tP6\tok\n";
        let mut reader = DelimitedReader::from_reader(Path::new("mem.tsv"), data).unwrap();
        let rows = reader.next_chunk(10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].defect(), None);
        assert_eq!(rows[1].defect(), Some(INVALID_ENCODING));
        assert_eq!(rows[1].line(), 3);
        assert_eq!(rows[2].get("protein_a"), Some("P5"));
    }

    #[test]
    fn chunks_are_bounded() {
        let data = "a\tb\n1\t2\n3\t4\n5\t6\n";
        let mut reader = DelimitedReader::from_reader(Path::new("mem.tsv"), data.as_bytes()).unwrap();
        assert_eq!(reader.next_chunk(2).unwrap().len(), 2);
        assert_eq!(reader.next_chunk(2).unwrap().len(), 1);
        assert!(reader.next_chunk(2).unwrap().is_empty());
    }
}
