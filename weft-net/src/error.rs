//! Error types for the weft-net crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("address already bound: {0}")]
    AddrInUse(String),

    #[error("no endpoint bound at {0}")]
    NotFound(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("endpoint {0} closed")]
    ConnectionClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("seal error: {0}")]
    Seal(String),
}
