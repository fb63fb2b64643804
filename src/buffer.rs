//! Buffer slots and the handles that move their contents in and out.
//!
//! A slot's backing memory is shared (`triomphe::Arc`) between the pool
//! and any in-flight frame handle, so teardown never has to wait on a
//! consumer: the queue breaks its weak link and the last handle drop frees
//! the mapping.

use std::os::fd::RawFd;
use std::ptr::NonNull;

use arrayvec::ArrayVec;
use triomphe::Arc;

use crate::device::{Device, MAX_PLANES, WireBuffer, WirePlane};
use crate::queue::QueueCore;
use crate::track::Meta;
use crate::weak_link::WeakLinkClient;

/// One plane's backing region.
pub struct PlaneBuf {
    ptr: *mut u8,
    len: usize,
    kind: BufKind,
}

enum BufKind {
    /// Process heap, used by device doubles.
    Heap,
    /// Device memory mapped into this process; unmapped on drop.
    Mapped,
    /// Externally owned handle; no CPU view, the fd stays with the caller.
    External(RawFd),
}

unsafe impl Send for PlaneBuf {}
unsafe impl Sync for PlaneBuf {}

impl PlaneBuf {
    pub fn heap(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        PlaneBuf { ptr, len, kind: BufKind::Heap }
    }

    /// Wraps a region obtained from `mmap`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mapping of exactly `len` bytes that stays
    /// valid until this value is dropped, which will unmap it.
    pub unsafe fn mapped(ptr: NonNull<u8>, len: usize) -> Self {
        PlaneBuf { ptr: ptr.as_ptr(), len, kind: BufKind::Mapped }
    }

    pub fn external(fd: RawFd, len: usize) -> Self {
        PlaneBuf { ptr: std::ptr::null_mut(), len, kind: BufKind::External(fd) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn external_fd(&self) -> Option<RawFd> {
        match self.kind {
            BufKind::External(fd) => Some(fd),
            _ => None,
        }
    }

    /// CPU view of the region; empty for external backings.
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable view through a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot in a state that makes it the only
    /// accessor (an Available slot under the owning queue's lock).
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        debug_assert!(!self.ptr.is_null());
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PlaneBuf {
    fn drop(&mut self) {
        match self.kind {
            BufKind::Heap => unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(self.ptr, self.len)));
            },
            BufKind::Mapped => unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            },
            BufKind::External(_) => {}
        }
    }
}

/// Where one buffer slot currently is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotStatus {
    /// Owned by the pool, free for the next submission.
    Available,
    /// Owned by the device.
    Queued,
    /// Owned by exactly one external handle.
    External,
}

/// One device-registered buffer and its status. Status only ever walks
/// Available -> Queued -> External -> Available, with Queued -> Available
/// allowed on stream-off.
pub(crate) struct SlotRecord {
    pub index: u32,
    pub status: SlotStatus,
    pub planes: ArrayVec<Arc<PlaneBuf>, MAX_PLANES>,
}

impl SlotRecord {
    /// Wire descriptor re-queuing this slot empty (capture recycling).
    pub fn recycle_wire(&self) -> WireBuffer {
        let mut wire = WireBuffer { index: self.index, ..Default::default() };
        for p in &self.planes {
            wire.planes.push(WirePlane {
                bytesused: 0,
                length: p.len() as u32,
                fd: p.external_fd(),
            });
        }
        wire
    }
}

/// How a submitted payload is backed.
pub enum PayloadData<'a> {
    /// Borrowed bytes, copied into the slot's mapping (truncating to its
    /// capacity if oversized).
    Bytes(&'a [u8]),
    /// Externally allocated buffer handed to the device by handle.
    External { fd: RawFd, len: u32 },
}

impl PayloadData<'_> {
    pub fn len(&self) -> usize {
        match self {
            PayloadData::Bytes(b) => b.len(),
            PayloadData::External { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of input from the upstream producer. An empty `Bytes` payload
/// is the drain marker.
pub struct Payload<'a> {
    pub data: PayloadData<'a>,
    pub meta: Meta,
    pub control: Option<&'a crate::device::ControlBlock>,
}

impl<'a> Payload<'a> {
    pub fn bytes(data: &'a [u8], meta: Meta) -> Self {
        Payload { data: PayloadData::Bytes(data), meta, control: None }
    }

    pub fn end_marker() -> Self {
        Payload { data: PayloadData::Bytes(&[]), meta: Meta::default(), control: None }
    }
}

/// What a submission reported back.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitReport {
    /// Key the metadata travels under; useful for correlating logs.
    pub key: u64,
    /// The payload exceeded the negotiated buffer size and was truncated.
    pub truncated: bool,
}

/// A completed buffer handed to the downstream consumer.
///
/// Holds the slot exclusively until dropped; dropping re-queues the slot to
/// the device (capture buffers must keep cycling) or, if the owning queue
/// is gone or stopped, releases it. Safe to drop from any thread.
pub struct Frame<D: Device> {
    pub meta: Meta,
    /// Interpolated timestamp to fall back on when `meta.pts` is `None`.
    pub best_effort_pts: Option<i64>,
    /// Device flagged an error on this buffer; content delivered as-is.
    pub corrupted: bool,
    pub sequence: u32,
    pub(crate) index: u32,
    pub(crate) planes: ArrayVec<Arc<PlaneBuf>, MAX_PLANES>,
    pub(crate) bytesused: ArrayVec<u32, MAX_PLANES>,
    pub(crate) link: WeakLinkClient<std::sync::Arc<QueueCore<D>>>,
}

impl<D: Device> Frame<D> {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Valid bytes of one plane.
    pub fn plane(&self, i: usize) -> &[u8] {
        let used = self.bytesused[i] as usize;
        &self.planes[i].as_slice()[..used.min(self.planes[i].len())]
    }

    /// Valid bytes of the first plane.
    pub fn data(&self) -> &[u8] {
        self.plane(0)
    }
}

impl<D: Device> Drop for Frame<D> {
    fn drop(&mut self) {
        if let Some(core) = self.link.lock() {
            core.recycle(self.index);
        }
        // Link broken: the queue is gone, the Arc'd planes go down with us.
    }
}
