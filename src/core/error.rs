//! Errors surfaced by the analyzer core. Core files are frequently damaged
//! (usually truncated) so most of these are recoverable: commands report them
//! and the session keeps going.
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Mapping a file from disk failed.
    #[error("couldn't map {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad magic, wrong class, wrong machine, malformed program header.
    #[error("invalid ELF: {reason}")]
    InvalidElf { reason: String },

    /// A virtual address didn't translate to any bytes in the core. This is
    /// the most common error by far: callers are expected to catch it at
    /// command granularity and keep the session alive.
    #[error("invalid address 0x{vaddr:x}")]
    InvalidAddress { vaddr: u64 },

    /// A load block's virtual range collided with an existing block.
    #[error("load block 0x{vaddr:x}..0x{end:x} overlaps an existing block")]
    Overlap { vaddr: u64, end: u64 },

    /// A decoder was invoked before the layout tables were initialized.
    /// This is a programming error, not target-data corruption.
    #[error("{0} used before layouts were initialized")]
    PreconditionViolated(&'static str),

    /// Symbol, link map, note, or similar lookup came up empty.
    #[error("{0} not found")]
    NotFound(String),

    #[error("unsupported: {feature}")]
    Unsupported { feature: String },
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> CoreError {
        CoreError::NotFound(what.into())
    }

    pub fn unsupported(feature: impl Into<String>) -> CoreError {
        CoreError::Unsupported {
            feature: feature.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These strings end up in front of users verbatim, so pin them down.
    #[test]
    fn diagnostic_text() {
        insta::assert_snapshot!(
            CoreError::InvalidAddress { vaddr: 0x7fff_1234 }.to_string(),
            @"invalid address 0x7fff1234"
        );
        insta::assert_snapshot!(
            CoreError::Overlap { vaddr: 0x1000, end: 0x2000 }.to_string(),
            @"load block 0x1000..0x2000 overlaps an existing block"
        );
        insta::assert_snapshot!(
            CoreError::unsupported("compressed zip").to_string(),
            @"unsupported: compressed zip"
        );
        insta::assert_snapshot!(
            CoreError::not_found("symbol nterp_op_nop").to_string(),
            @"symbol nterp_op_nop not found"
        );
    }
}
