pub mod aggregate;
pub mod annotation;
pub mod append;
pub mod config;
pub mod datasets;
pub mod domain;
pub mod error;
pub mod index;
pub mod ingest;
pub mod keys;
pub mod output;
pub mod remote;
pub mod retry;
pub mod source;
