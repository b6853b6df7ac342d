use std::io;

/// Errors surfaced by the router's setup and transport layers.
///
/// The packet pipeline itself never propagates errors out of
/// `handle_packet`; malformed traffic is logged and dropped there.
/// `Malformed` is what the wire-format parsers report on the way to
/// that drop decision.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed {layer} header: {reason}")]
    Malformed {
        layer: &'static str,
        reason: &'static str,
    },

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },
}

impl Error {
    /// Shorthand used by the wire-format parsers.
    pub(crate) fn malformed(layer: &'static str, reason: &'static str) -> Self {
        Error::Malformed { layer, reason }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
