//! Structured error type for the registry/session/HTTP core.
//!
//! `main.rs` and other pure CLI glue still use plain `anyhow::Error`; this
//! type exists so the HTTP layer can map a failure to its mandated status
//! code without string-matching a message.

use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to spawn session: {0}")]
    SpawnFailure(String),

    #[error("io failure: {0}")]
    IoFailure(String),

    #[error("unauthorized")]
    Unauthorized,
}

impl Error {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SpawnFailure(_) | Self::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
