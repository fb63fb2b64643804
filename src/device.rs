//! The device seam: everything the queue layer needs from a
//! memory-to-memory codec device, expressed as one trait so the core can
//! run against real hardware or an in-memory double.

use std::fmt;

use arrayvec::ArrayVec;

use crate::buffer::PlaneBuf;
use crate::errors::Result;

/// Upper bound on planes per buffer, matching the kernel ABI limit.
pub const MAX_PLANES: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Carries data into the device: compressed input for a decoder, raw
    /// frames for an encoder.
    Output,
    /// Carries results out of the device.
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Output => write!(f, "output"),
            Direction::Capture => write!(f, "capture"),
        }
    }
}

/// Packed four-character pixel/codec format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const fn from_bytes(b: [u8; 4]) -> Self {
        FourCc(b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0.to_le_bytes();
        for c in b {
            if c.is_ascii_graphic() || c == b' ' {
                write!(f, "{}", c as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Codec families the surrounding control-block builders understand. The
/// queue layer only tags payloads with the kind; it never interprets the
/// attached control data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CodecKind {
    H264,
    Mpeg2,
    Vp8,
    Vp9,
}

impl CodecKind {
    pub fn fourcc(self) -> FourCc {
        match self {
            CodecKind::H264 => FourCc::from_bytes(*b"H264"),
            CodecKind::Mpeg2 => FourCc::from_bytes(*b"MPG2"),
            CodecKind::Vp8 => FourCc::from_bytes(*b"VP80"),
            CodecKind::Vp9 => FourCc::from_bytes(*b"VP90"),
        }
    }
}

/// Opaque per-payload control data produced by a codec-specific builder.
/// Passed through to the backend untouched.
#[derive(Clone, Debug)]
pub struct ControlBlock {
    pub codec: CodecKind,
    pub data: Box<[u8]>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PlaneFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
}

/// Negotiated (or requested) format of one queue direction.
#[derive(Clone, Debug, Default)]
pub struct FormatDesc {
    pub pixelformat: FourCc,
    pub width: u32,
    pub height: u32,
    pub planes: ArrayVec<PlaneFormat, MAX_PLANES>,
}

impl FormatDesc {
    pub fn single_plane(pixelformat: FourCc, width: u32, height: u32, sizeimage: u32) -> Self {
        let mut planes = ArrayVec::new();
        planes.push(PlaneFormat { sizeimage, bytesperline: 0 });
        FormatDesc { pixelformat, width, height, planes }
    }

    pub fn same_resolution(&self, other: &FormatDesc) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Size of the first plane, the one enforced against caller minimums.
    pub fn primary_size(&self) -> u32 {
        self.planes.first().map(|p| p.sizeimage).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireFlags {
    /// Device marked this as the final buffer of the stream.
    pub last: bool,
    /// Device flagged a mid-stream error on this buffer; its content is
    /// delivered but must be marked corrupted.
    pub error: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WirePlane {
    pub bytesused: u32,
    pub length: u32,
    /// Externally supplied backing handle, when the queue runs in
    /// external-memory mode.
    pub fd: Option<std::os::fd::RawFd>,
}

/// The per-buffer descriptor exchanged with the device on queue/dequeue.
/// `timestamp` is opaque to the device and echoed back unchanged; it is the
/// only side channel the ABI offers for caller metadata.
#[derive(Clone, Debug, Default)]
pub struct WireBuffer {
    pub index: u32,
    pub timestamp: u64,
    pub sequence: u32,
    pub flags: WireFlags,
    pub planes: ArrayVec<WirePlane, MAX_PLANES>,
}

impl WireBuffer {
    pub fn bytesused(&self) -> u32 {
        self.planes.first().map(|p| p.bytesused).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlaneGeometry {
    pub length: u32,
    pub mem_offset: u32,
}

/// Device-chosen geometry of one registered buffer.
#[derive(Clone, Debug, Default)]
pub struct SlotGeometry {
    pub planes: ArrayVec<PlaneGeometry, MAX_PLANES>,
}

/// Out-of-band events dequeued from the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceEvent {
    /// Output dimensions changed mid-stream; the capture side must be
    /// reinitialized once its in-flight buffers drain.
    SourceChange,
    EndOfStream,
}

/// What the device advertised at event subscription time.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventSupport {
    pub source_change: bool,
    pub eos: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub capture: bool,
    pub output: bool,
    pub event: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.capture || self.output || self.event
    }
}

/// Result of asking the device to stop/drain a stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopOutcome {
    /// The device accepted the command and will flag its last buffer.
    Started,
    /// The device has no stop command; the caller falls back to stopping
    /// the output queue.
    Unsupported,
}

/// Memory backing negotiated for one queue direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MemoryKind {
    /// Device-allocated buffers mapped into this process.
    #[default]
    Mmap,
    /// Caller supplies an external handle per submission.
    External,
}

/// One memory-to-memory codec device, as seen by the queue layer.
///
/// Calls mirror the kernel protocol one to one: format try/set/get,
/// buffer allocation and mapping, queue/dequeue, stream toggling, event
/// delivery and the drain command. Implementations retry interrupted
/// calls internally; `Err(Empty)` and `Err(Backpressure)` are the only
/// non-fatal errors they surface.
pub trait Device: Send + Sync + 'static {
    /// Probes whether `fmt` is acceptable without applying it. Returns the
    /// closest format the device would use.
    fn try_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc>;

    /// Applies a format; the device may adjust sizes upwards. Returns what
    /// was actually set.
    fn set_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc>;

    /// Reads back the current format, e.g. after a source change.
    fn format(&self, dir: Direction) -> Result<FormatDesc>;

    /// Registers `count` buffers (0 releases the set). Returns the count
    /// the device actually granted, which may differ.
    fn request_buffers(&self, dir: Direction, memory: MemoryKind, count: u32) -> Result<u32>;

    fn query_buffer(&self, dir: Direction, index: u32) -> Result<SlotGeometry>;

    /// Makes one plane of a registered buffer addressable by this process.
    fn map_plane(&self, dir: Direction, index: u32, plane: usize, geom: &PlaneGeometry)
    -> Result<PlaneBuf>;

    /// Hands a buffer to the device. `Err(Backpressure)` when the driver
    /// queue is full; the slot stays with the caller.
    fn queue(&self, dir: Direction, buf: &WireBuffer, control: Option<&ControlBlock>)
    -> Result<()>;

    /// Takes a finished buffer back. `Err(Empty)` when none is ready.
    fn dequeue(&self, dir: Direction) -> Result<WireBuffer>;

    fn stream_on(&self, dir: Direction) -> Result<()>;

    fn stream_off(&self, dir: Direction) -> Result<()>;

    /// Subscribes to out-of-band events; reports which ones the device can
    /// deliver.
    fn subscribe_events(&self) -> Result<EventSupport>;

    /// `Ok(None)` when the event queue is empty.
    fn next_event(&self) -> Result<Option<DeviceEvent>>;

    /// Requests an explicit drain.
    fn stop_stream_cmd(&self) -> Result<StopOutcome>;

    /// Device-required minimum buffer count for a direction, 0 if it does
    /// not report one.
    fn min_buffers(&self, _dir: Direction) -> Result<u32> {
        Ok(0)
    }

    /// Blocks until any wanted readiness is signalled or `timeout_ms`
    /// elapses (returning an all-false [`Readiness`]). Negative means no
    /// timeout.
    fn wait(&self, wanted: Readiness, timeout_ms: i32) -> Result<Readiness>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_packs_little_endian() {
        let fourcc = FourCc::from_bytes(*b"H264");
        assert_eq!(fourcc.0, 0x34363248);
        assert_eq!(fourcc.to_string(), "H264");
    }

    #[test]
    fn fourcc_display_masks_unprintable_bytes() {
        assert_eq!(FourCc(0x0102_0304).to_string(), "....");
    }

    #[test]
    fn codec_kinds_map_to_coded_formats() {
        assert_eq!(CodecKind::Mpeg2.fourcc().to_string(), "MPG2");
        assert_eq!(CodecKind::Vp9.fourcc().to_string(), "VP90");
    }
}
