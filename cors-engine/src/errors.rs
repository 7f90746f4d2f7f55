//! Top-level and shared error types. Subsystem-local error enums live next
//! to the subsystem that raises them (e.g. `rtcm_decoder::DecodeError`);
//! this module holds the ones referenced from more than one place.

use thiserror::Error;

/// Errors that can occur while loading the `key = value` config file or any
/// of its referenced CSV side files. All of these are fatal at startup:
/// malformed startup config aborts before any subsystem has started
/// accepting network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config line {line_no}: {text:?}")]
    MalformedLine { line_no: usize, text: String },
    #[error("malformed CSV row in {path} line {line_no}: {text:?}")]
    MalformedCsvRow {
        path: String,
        line_no: usize,
        text: String,
    },
    #[error("missing required config key {0}")]
    MissingKey(&'static str),
}

/// A logical-invariant violation: missing source, missing baseline, missing
/// vertex. Subsystems return this from control-plane operations; the
/// operation becomes a no-op and callers log and drop it, they never panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFound {
    #[error("no such source: {0}")]
    Source(String),
    #[error("no such source id: {0}")]
    SourceId(i32),
    #[error("no such baseline: {0} -> {1}")]
    Baseline(i32, i32),
    #[error("no such vertex for source id {0}")]
    Vertex(i32),
    #[error("no such virtual station: {0}")]
    VirtualStation(String),
    #[error("no such user: {0}")]
    User(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
}
