use thiserror::Error;

/// The container a [`FormatError`] was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Png,
    Jpeg,
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Container::Png => f.write_str("PNG"),
            Container::Jpeg => f.write_str("JPEG"),
        }
    }
}

/// Input bytes do not match the container format the caller claimed.
///
/// This is the only error the read path propagates; every other problem inside
/// the resolution pipeline degrades to "no metadata from this candidate".
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("missing {0} signature")]
    Signature(Container),

    #[error("{container} record at offset {offset} overruns the buffer ({len} bytes declared)")]
    Overrun {
        container: Container,
        offset: usize,
        len: usize,
    },

    #[error("PNG stream has no IEND chunk")]
    MissingEnd,

    #[error("malformed {container} stream: {reason}")]
    Malformed { container: Container, reason: String },

    #[error("{container} metadata payload of {len} bytes does not fit in one record")]
    TooLarge { container: Container, len: usize },
}
