use thiserror::Error;

/// Errors surfaced by the tree and its serialization paths.
///
/// Checked conversion methods (`*_checked`) return `Option` instead of
/// `Error::OutOfBounds`; the error variant is used by the paths that cannot
/// report null.
#[derive(Debug, Error)]
pub enum Error {
    /// A coordinate or key is outside the interval the tree can address, or
    /// a depth is outside `[0, depth_levels - 1]`.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// `depth_levels` outside the supported range at construction.
    #[error("depth_levels must be in [{min}, {max}], got {got}")]
    Config { min: u8, max: u8, got: u8 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, unsupported version, or a short read.
    #[error("malformed file: {0}")]
    Format(String),

    /// Block decompression failed. The reader's position has advanced past
    /// the framed length, so subsequent streams remain readable.
    #[error("decompression failed: {0}")]
    Compression(String),

    /// The tree-structure stream disagrees with the counted nodes.
    #[error("inconsistent tree structure: {0}")]
    Structure(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
