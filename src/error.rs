use std::io;

use thiserror::Error;

use crate::intercept::CallId;

/// Everything that can go wrong while resolving a site or capturing a call.
///
/// [`Error::SiteNotFound`] and [`Error::Attach`] are fatal: the session never
/// starts. The per-call errors ([`Error::ReadFailure`],
/// [`Error::NegativeLength`], [`Error::UnmatchedExit`]) drop the output line of
/// that single call and leave the session running.
#[derive(Error, Debug)]
pub enum Error {
    /// The library is not loaded in the target, or it does not export the symbol.
    #[error("site not found: {}", site_name(.library, .symbol))]
    SiteNotFound {
        library: String,
        symbol: Option<String>,
    },

    #[error("failed to read {length} bytes at {address:#x}")]
    ReadFailure {
        address: usize,
        length: usize,
        #[source]
        source: io::Error,
    },

    #[error("captured length {length} is negative")]
    NegativeLength { length: i32 },

    #[error("exit of call {call} has no captured entry")]
    UnmatchedExit { call: CallId },

    #[error("interceptor refused to attach: {0}")]
    Attach(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed library image: {0}")]
    Binary(#[from] goblin::error::Error),
}

fn site_name(library: &str, symbol: &Option<String>) -> String {
    match symbol {
        Some(symbol) => format!("{}!{}", library, symbol),
        None => library.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
