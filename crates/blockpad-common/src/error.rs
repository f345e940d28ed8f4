//! Configuration errors.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while assembling a [`Config`](crate::Config).
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("environment variable {var} has invalid value {value:?}")]
    #[diagnostic(code(config::env), help("{expected}"))]
    InvalidEnv {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid endpoint URL {url}: {message}")]
    #[diagnostic(
        code(config::url),
        help("the endpoint must be an absolute http(s) URL, e.g. http://localhost:8000/api/")
    )]
    UrlParse { url: String, message: String },

    #[error("failed to access config file {}", path.display())]
    #[diagnostic(code(config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", path.display())]
    #[diagnostic(code(config::format))]
    Format { path: PathBuf, message: String },

    #[error("unsupported config file format: {}", path.display())]
    #[diagnostic(code(config::format), help("use a .json or .toml file"))]
    UnsupportedFormat { path: PathBuf },
}
