use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("access [{offset}, {offset}+{len}) out of bounds of region size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("region is closed")]
    ClosedRegion,
    #[error("corrupt cache index: {0}")]
    CorruptIndex(&'static str),
    #[error("cache capacity exceeded")]
    CapacityExceeded,
    #[error("end of bus file reached")]
    EndOfBus,
    #[error("coordination failure: {0}")]
    CoordinationFailure(String),
    #[error("source io failure: {0}")]
    SourceIOFailure(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("io error: {0}")]
    Io(String),
    #[error("cache daemon stopped")]
    DaemonStopped,
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(src: std::io::Error) -> Error {
        Error::Io(src.to_string())
    }
}
