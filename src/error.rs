use thiserror::Error;

#[derive(Error, Debug)]
pub enum LfsError {
    #[error("unable to detect filesystem: {0}")]
    DetectionFailed(String),

    #[error("metadata pair {{{0}, {1}}}: neither block holds a valid commit")]
    CorruptMetadata(u32, u32),

    #[error("malformed directory tree: {0}")]
    MalformedTree(String),

    #[error("block {block} out of range ({count} blocks)")]
    OutOfRange { block: u32, count: u32 },

    #[error("no free blocks left in lookahead window")]
    NoSpace,

    #[error("entry already exists: {0}")]
    NameConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported filesystem version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LfsError>;
