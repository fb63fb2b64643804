use std::io;

use thiserror::Error;

use crate::device::{Direction, FourCc};

#[derive(Error, Debug)]
pub enum Error {
    /// No free slot, or the device submission queue is momentarily full.
    /// Always retryable.
    #[error("no free buffer slot")]
    Backpressure,
    /// Nothing ready within the requested timeout. Non-fatal.
    #[error("no data ready")]
    Empty,
    /// The stream has finished draining. Returned repeatedly once seen.
    #[error("end of stream")]
    EndOfStream,
    /// The queue behind this call has been released.
    #[error("queue is shut down")]
    ShutDown,
    #[error("device rejected {fourcc} on the {dir} queue")]
    FormatRejected { dir: Direction, fourcc: FourCc },
    #[error("device granted no buffers on the {0} queue")]
    NoBuffers(Direction),
    /// The device cannot signal resolution changes and the session was not
    /// configured for fixed dimensions.
    #[error("device has no resolution-change events; opt into fixed dimensions")]
    SourceChangeUnsupported,
    #[error("{0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for outcomes the caller is expected to retry or poll past.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backpressure | Error::Empty)
    }

    pub(crate) fn os(errno: i32) -> Error {
        Error::Io(io::Error::from_raw_os_error(errno))
    }
}
