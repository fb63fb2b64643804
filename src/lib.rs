//! Buffer-queue management for stateful memory-to-memory codec devices:
//! one queue feeds data in, one carries results out, and this layer keeps
//! the buffer ownership, metadata round-tripping, mid-stream resolution
//! changes and end-of-stream drains straight between them.

#[cfg(all(feature = "v4l2", not(target_os = "linux")))]
compile_error!("The v4l2 backend only builds on linux targets.");

pub mod buffer;
pub mod device;
pub mod errors;
mod pool;
mod queue;
pub mod session;
pub mod track;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod weak_link;

#[cfg(test)]
pub(crate) mod fake;

pub use buffer::{Frame, Payload, PayloadData, SubmitReport};
pub use device::{
    CodecKind, ControlBlock, Device, Direction, FormatDesc, FourCc, MemoryKind,
};
pub use errors::{Error, Result};
pub use session::{Session, SessionConfig, SessionState, coded_frame_size};
pub use track::Meta;
