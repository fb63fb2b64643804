//! One direction of a memory-to-memory device: format negotiation,
//! streaming state and the buffer traffic over it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::buffer::{Payload, PayloadData, PlaneBuf, SlotStatus, SubmitReport};
use crate::device::{
    Device, Direction, FormatDesc, MAX_PLANES, MemoryKind, WireBuffer, WirePlane,
};
use crate::errors::{Error, Result};
use crate::pool::BufferPool;
use crate::weak_link::{WeakLink, WeakLinkClient};

pub(crate) struct QueueState {
    pub pool: Option<BufferPool>,
    pub format: FormatDesc,
    pub memory: MemoryKind,
    pub streaming: bool,
    /// Slots currently owned by the device.
    pub queued: usize,
    /// A last-buffer condition was observed; the next dequeue is EOS.
    pub flag_last: bool,
}

/// Bookkeeping shared between a [`Queue`] and the frame handles it has in
/// the wild. Each direction has its own lock, so a stalled completion path
/// cannot block new submissions.
pub(crate) struct QueueCore<D: Device> {
    dev: Arc<D>,
    dir: Direction,
    state: Mutex<QueueState>,
}

impl<D: Device> QueueCore<D> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called from a frame handle drop, possibly on another thread. While
    /// the queue streams, capture slots go straight back to the device;
    /// otherwise the slot is simply freed.
    pub(crate) fn recycle(&self, index: u32) {
        let mut st = self.lock();
        let streaming = st.streaming;
        let Some(pool) = st.pool.as_mut() else {
            return;
        };
        let Some(slot) = pool.slot_mut(index) else {
            return;
        };
        debug_assert_eq!(slot.status, SlotStatus::External);

        if self.dir == Direction::Capture && streaming {
            let wire = slot.recycle_wire();
            match self.dev.queue(self.dir, &wire, None) {
                Ok(()) => {
                    slot.status = SlotStatus::Queued;
                    st.queued += 1;
                    return;
                }
                Err(e) => warn!("{}: re-queue of slot {index} failed: {e}", self.dir),
            }
        }
        slot.status = SlotStatus::Available;
    }
}

/// A completed capture buffer before it is wrapped into a [`Frame`].
pub(crate) struct Dequeued {
    pub wire: WireBuffer,
    pub planes: ArrayVec<triomphe::Arc<PlaneBuf>, MAX_PLANES>,
}

pub(crate) struct Queue<D: Device> {
    core: Arc<QueueCore<D>>,
    link: Option<WeakLink<Arc<QueueCore<D>>>>,
}

impl<D: Device> Queue<D> {
    pub fn new(dev: Arc<D>, dir: Direction, memory: MemoryKind) -> Self {
        Queue {
            core: Arc::new(QueueCore {
                dev,
                dir,
                state: Mutex::new(QueueState {
                    pool: None,
                    format: FormatDesc::default(),
                    memory,
                    streaming: false,
                    queued: 0,
                    flag_last: false,
                }),
            }),
            link: None,
        }
    }

    pub fn dir(&self) -> Direction {
        self.core.dir
    }

    fn dev(&self) -> &D {
        &self.core.dev
    }

    /// Try/set exchange with the device. The pixel format must survive the
    /// probe; dimensions and sizes are the device's call, except that the
    /// first plane is re-asked once if it came back under `min_size`.
    pub fn negotiate(&self, requested: &FormatDesc, min_size: u32) -> Result<FormatDesc> {
        let dir = self.dir();
        let tried = self.dev().try_format(dir, requested)?;
        if tried.pixelformat != requested.pixelformat {
            return Err(Error::FormatRejected { dir, fourcc: requested.pixelformat });
        }

        let mut want = tried;
        if let Some(p) = want.planes.first_mut()
            && p.sizeimage < min_size
        {
            p.sizeimage = min_size;
        }
        let mut granted = self.dev().set_format(dir, &want)?;
        if granted.primary_size() < min_size {
            want = granted;
            if let Some(p) = want.planes.first_mut() {
                p.sizeimage = min_size;
            }
            granted = self.dev().set_format(dir, &want)?;
        }

        debug!(
            "{dir}: negotiated {} {}x{}, sizeimage {}",
            granted.pixelformat,
            granted.width,
            granted.height,
            granted.primary_size()
        );
        self.core.lock().format = granted.clone();
        Ok(granted)
    }

    /// Takes over a format read back from the device (capture reinit).
    pub fn adopt_format(&self, fmt: FormatDesc) {
        self.core.lock().format = fmt;
    }

    pub fn format(&self) -> FormatDesc {
        self.core.lock().format.clone()
    }

    pub fn allocate_buffers(&mut self, count: u32) -> Result<u32> {
        let (dir, memory) = (self.dir(), self.core.lock().memory);
        let pool = BufferPool::allocate(self.dev(), dir, memory, count)?;
        let granted = pool.len() as u32;

        let mut st = self.core.lock();
        debug_assert!(st.pool.is_none(), "allocate without release");
        st.pool = Some(pool);
        st.queued = 0;
        st.flag_last = false;
        drop(st);

        self.link = Some(WeakLink::new(Arc::clone(&self.core)));
        Ok(granted)
    }

    /// Drops the pool and unregisters the buffer set. Handles still held by
    /// consumers are orphaned first, so this never waits on them.
    pub fn release_buffers(&mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            link.break_link();
        }

        let mut st = self.core.lock();
        if st.pool.take().is_none() {
            return Ok(());
        }
        st.queued = 0;
        let memory = st.memory;
        drop(st);

        self.dev().request_buffers(self.dir(), memory, 0)?;
        Ok(())
    }

    /// Client for frame handles; `None` while no buffer set is live.
    pub fn client(&self) -> Option<WeakLinkClient<Arc<QueueCore<D>>>> {
        self.link.as_ref().map(|l| l.client())
    }

    /// Idempotent. A capture queue first hands every free slot to the
    /// device: it must always own buffers to have somewhere to put output.
    pub fn stream_on(&self) -> Result<()> {
        let mut st = self.core.lock();
        if st.streaming {
            return Ok(());
        }

        if self.dir() == Direction::Capture
            && let Some(pool) = st.pool.as_mut()
        {
            let mut primed = 0;
            for index in pool.available_indices() {
                let Some(slot) = pool.slot_mut(index) else {
                    continue;
                };
                let wire = slot.recycle_wire();
                self.dev().queue(self.dir(), &wire, None)?;
                slot.status = SlotStatus::Queued;
                primed += 1;
            }
            st.queued += primed;
            debug!("capture: primed {primed} buffers");
        }

        self.dev().stream_on(self.dir())?;
        st.streaming = true;
        st.flag_last = false;
        Ok(())
    }

    /// Idempotent. Device-side work is discarded: every Queued slot comes
    /// back to Available and the queued count resets.
    pub fn stream_off(&self) -> Result<()> {
        let mut st = self.core.lock();
        if !st.streaming && st.pool.is_none() {
            return Ok(());
        }
        if st.streaming {
            self.dev().stream_off(self.dir())?;
        }
        if let Some(pool) = st.pool.as_mut() {
            let flushed = pool.flush_queued();
            if flushed > 0 {
                debug!("{}: flushed {flushed} queued slots", self.dir());
            }
        }
        st.queued = 0;
        st.streaming = false;
        st.flag_last = false;
        Ok(())
    }

    /// Non-blocking submission of one payload on the output queue. The
    /// metadata key rides in the wire timestamp field.
    pub fn submit(&self, payload: &Payload, key: u64) -> Result<SubmitReport> {
        debug_assert_eq!(self.dir(), Direction::Output);
        self.reclaim();

        let mut st = self.core.lock();
        let Some(pool) = st.pool.as_mut() else {
            return Err(Error::ShutDown);
        };
        let Some(slot) = pool.acquire_free() else {
            return Err(Error::Backpressure);
        };

        let mut truncated = false;
        let mut wire = WireBuffer { index: slot.index, timestamp: key, ..Default::default() };
        for p in &slot.planes {
            wire.planes.push(WirePlane { bytesused: 0, length: p.len() as u32, fd: None });
        }

        match payload.data {
            PayloadData::Bytes(bytes) => {
                let cap = slot.planes[0].len();
                let n = bytes.len().min(cap);
                truncated = n < bytes.len();
                if truncated {
                    warn!("payload of {} bytes truncated to buffer size {cap}", bytes.len());
                }
                // Exclusive: the slot is Available and the queue lock is held.
                unsafe {
                    slot.planes[0].as_mut_slice()[..n].copy_from_slice(&bytes[..n]);
                }
                wire.planes[0].bytesused = n as u32;
            }
            PayloadData::External { fd, len } => {
                wire.planes[0] = WirePlane { bytesused: len, length: len, fd: Some(fd) };
            }
        }

        let index = slot.index;
        match self.dev().queue(self.dir(), &wire, payload.control) {
            Ok(()) => {
                // acquire_free borrowed mutably; re-fetch to update.
                if let Some(slot) = st.pool.as_mut().and_then(|p| p.slot_mut(index)) {
                    slot.status = SlotStatus::Queued;
                }
                st.queued += 1;
                Ok(SubmitReport { key, truncated })
            }
            // Driver queue full: the slot stays ours for the retry.
            Err(Error::Backpressure) => Err(Error::Backpressure),
            Err(e) => Err(e),
        }
    }

    /// Pulls back every output buffer the device has finished with.
    pub fn reclaim(&self) {
        debug_assert_eq!(self.dir(), Direction::Output);
        loop {
            match self.dev().dequeue(self.dir()) {
                Ok(wire) => {
                    let mut st = self.core.lock();
                    st.queued = st.queued.saturating_sub(1);
                    if let Some(slot) = st.pool.as_mut().and_then(|p| p.slot_mut(wire.index)) {
                        slot.status = SlotStatus::Available;
                    }
                }
                Err(Error::Empty) | Err(Error::EndOfStream) => return,
                Err(e) => {
                    debug!("output reclaim stopped: {e}");
                    return;
                }
            }
        }
    }

    /// Non-blocking capture dequeue, folding every way the device can say
    /// "stream over" into `Err(EndOfStream)`:
    /// an empty completion (re-queued so the slot is not leaked), the
    /// last-buffer flag (frame still delivered, next call returns EOS) and
    /// the driver's dequeue-past-end error.
    pub fn dequeue_ready(&self) -> Result<Dequeued> {
        debug_assert_eq!(self.dir(), Direction::Capture);
        if self.core.lock().flag_last {
            return Err(Error::EndOfStream);
        }

        let wire = match self.dev().dequeue(self.dir()) {
            Ok(wire) => wire,
            Err(Error::EndOfStream) => {
                self.core.lock().flag_last = true;
                return Err(Error::EndOfStream);
            }
            Err(e) => return Err(e),
        };

        let mut st = self.core.lock();
        st.queued = st.queued.saturating_sub(1);
        let Some(slot) = st.pool.as_mut().and_then(|p| p.slot_mut(wire.index)) else {
            return Err(Error::ShutDown);
        };

        if wire.bytesused() == 0 {
            // Zero-length capture return is the wire's end marker. Re-queue
            // so the device keeps its working set.
            debug!("capture: empty completion, treating as end of stream");
            let requeue = slot.recycle_wire();
            if self.dev().queue(Direction::Capture, &requeue, None).is_ok() {
                slot.status = SlotStatus::Queued;
                st.queued += 1;
            }
            st.flag_last = true;
            return Err(Error::EndOfStream);
        }

        slot.status = SlotStatus::External;
        let planes = slot.planes.clone();
        if wire.flags.last {
            debug!("capture: last-buffer flag on slot {}", wire.index);
            st.flag_last = true;
        }
        Ok(Dequeued { wire, planes })
    }

    pub fn queued_count(&self) -> usize {
        self.core.lock().queued
    }

    pub fn is_streaming(&self) -> bool {
        self.core.lock().streaming
    }

    /// True once a last-buffer condition was seen and not cleared by a
    /// stream toggle.
    pub fn done(&self) -> bool {
        self.core.lock().flag_last
    }

    pub fn has_pool(&self) -> bool {
        self.core.lock().pool.is_some()
    }

    pub fn external_count(&self) -> usize {
        self.core.lock().pool.as_ref().map(|p| p.external_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CodecKind, FormatDesc};
    use crate::fake::FakeDevice;
    use crate::track::Meta;

    fn coded_fmt(sizeimage: u32) -> FormatDesc {
        FormatDesc::single_plane(CodecKind::H264.fourcc(), 1280, 720, sizeimage)
    }

    fn output_queue(dev: &Arc<FakeDevice>, buffers: u32) -> Queue<FakeDevice> {
        dev.set_echo(false);
        let mut q = Queue::new(Arc::clone(dev), Direction::Output, MemoryKind::Mmap);
        q.negotiate(&coded_fmt(0), 1024).unwrap();
        q.allocate_buffers(buffers).unwrap();
        q.stream_on().unwrap();
        q
    }

    fn capture_queue(dev: &Arc<FakeDevice>, buffers: u32) -> Queue<FakeDevice> {
        dev.set_echo(false);
        let mut q = Queue::new(Arc::clone(dev), Direction::Capture, MemoryKind::Mmap);
        q.adopt_format(dev.format(Direction::Capture).unwrap());
        q.allocate_buffers(buffers).unwrap();
        q
    }

    #[test]
    fn negotiate_enlarges_to_device_minimum() {
        let dev = Arc::new(FakeDevice::new());
        dev.set_min_sizeimage(4096);
        let q = Queue::new(Arc::clone(&dev), Direction::Output, MemoryKind::Mmap);
        let granted = q.negotiate(&coded_fmt(1000), 1000).unwrap();
        assert_eq!(granted.primary_size(), 4096);
    }

    #[test]
    fn negotiate_rejects_unsupported_format() {
        let dev = Arc::new(FakeDevice::new());
        dev.set_reject(Direction::Output);
        let q = Queue::new(Arc::clone(&dev), Direction::Output, MemoryKind::Mmap);
        match q.negotiate(&coded_fmt(0), 1024) {
            Err(Error::FormatRejected { dir, .. }) => assert_eq!(dir, Direction::Output),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn device_grant_overrides_requested_count() {
        let dev = Arc::new(FakeDevice::new());
        dev.set_grant(Direction::Output, 2);
        dev.set_echo(false);
        let mut q = Queue::new(Arc::clone(&dev), Direction::Output, MemoryKind::Mmap);
        q.negotiate(&coded_fmt(0), 1024).unwrap();
        assert_eq!(q.allocate_buffers(4).unwrap(), 2);
    }

    #[test]
    fn submit_walks_slot_through_device_and_back() {
        let dev = Arc::new(FakeDevice::new());
        let q = output_queue(&dev, 2);

        let payload = Payload::bytes(b"frame data", Meta::default());
        let report = q.submit(&payload, 7).unwrap();
        assert_eq!(report.key, 7);
        assert!(!report.truncated);
        assert_eq!(q.queued_count(), 1);
        assert_eq!(dev.output_owned(), 1);

        // Device consumes the input; the slot comes back on reclaim.
        dev.finish_output();
        q.reclaim();
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn oversized_payload_is_truncated_not_dropped() {
        let dev = Arc::new(FakeDevice::new());
        let q = output_queue(&dev, 2);
        let big = vec![0xab; 5000]; // negotiated size is 1024
        let report = q.submit(&Payload::bytes(&big, Meta::default()), 1).unwrap();
        assert!(report.truncated);
        assert_eq!(q.queued_count(), 1);
    }

    #[test]
    fn pool_exhaustion_is_backpressure() {
        let dev = Arc::new(FakeDevice::new());
        let q = output_queue(&dev, 2);
        q.submit(&Payload::bytes(b"a", Meta::default()), 1).unwrap();
        q.submit(&Payload::bytes(b"b", Meta::default()), 2).unwrap();
        match q.submit(&Payload::bytes(b"c", Meta::default()), 3) {
            Err(Error::Backpressure) => {}
            other => panic!("expected backpressure, got {other:?}"),
        }
        // One completion on the device side frees the next submit.
        dev.finish_output();
        q.submit(&Payload::bytes(b"c", Meta::default()), 3).unwrap();
    }

    #[test]
    fn full_driver_queue_leaves_slot_with_caller() {
        let dev = Arc::new(FakeDevice::new());
        dev.set_output_queue_cap(1);
        let q = output_queue(&dev, 3);
        q.submit(&Payload::bytes(b"a", Meta::default()), 1).unwrap();
        match q.submit(&Payload::bytes(b"b", Meta::default()), 2) {
            Err(Error::Backpressure) => {}
            other => panic!("expected backpressure, got {other:?}"),
        }
        // The refused slot stayed Available: the device still owns one.
        assert_eq!(q.queued_count(), 1);
        assert_eq!(dev.output_owned(), 1);
    }

    #[test]
    fn capture_stream_on_primes_every_free_slot() {
        let dev = Arc::new(FakeDevice::new());
        let q = capture_queue(&dev, 4);
        assert_eq!(q.queued_count(), 0);
        q.stream_on().unwrap();
        assert_eq!(q.queued_count(), 4);
        assert_eq!(dev.capture_owned(), 4);
        // Idempotent.
        q.stream_on().unwrap();
        assert_eq!(q.queued_count(), 4);
    }

    #[test]
    fn stream_off_flushes_queued_slots() {
        let dev = Arc::new(FakeDevice::new());
        let q = capture_queue(&dev, 4);
        q.stream_on().unwrap();
        q.stream_off().unwrap();
        assert_eq!(q.queued_count(), 0);
        assert!(!q.done());
        // And again without complaint.
        q.stream_off().unwrap();
        // Slots are usable for the next cycle.
        q.stream_on().unwrap();
        assert_eq!(q.queued_count(), 4);
    }

    #[test]
    fn empty_completion_folds_to_eos_and_requeues() {
        let dev = Arc::new(FakeDevice::new());
        let q = capture_queue(&dev, 2);
        q.stream_on().unwrap();
        dev.complete_capture_empty();
        match q.dequeue_ready() {
            Err(Error::EndOfStream) => {}
            Ok(_) => panic!("expected eos, got a frame"),
            Err(e) => panic!("expected eos, got {e:?}"),
        }
        assert!(q.done());
        // The empty buffer went straight back to the device.
        assert_eq!(dev.capture_owned(), 2);
        assert_eq!(q.queued_count(), 2);
        // Deterministic from here on.
        assert!(matches!(q.dequeue_ready(), Err(Error::EndOfStream)));
    }

    #[test]
    fn dequeued_slot_recycles_to_device_on_release() {
        let dev = Arc::new(FakeDevice::new());
        let q = capture_queue(&dev, 2);
        q.stream_on().unwrap();
        dev.complete_capture(42);
        let dq = q.dequeue_ready().unwrap();
        assert_eq!(dq.wire.timestamp, 42);
        assert_eq!(q.queued_count(), 1);
        assert_eq!(q.external_count(), 1);

        let client = q.client().unwrap();
        client.lock().unwrap().recycle(dq.wire.index);
        assert_eq!(q.queued_count(), 2);
        assert_eq!(q.external_count(), 0);
    }

    #[test]
    fn control_blocks_reach_the_device_untouched() {
        use crate::device::ControlBlock;
        let dev = Arc::new(FakeDevice::new());
        let q = output_queue(&dev, 2);
        let cb = ControlBlock { codec: CodecKind::H264, data: vec![1, 2, 3].into_boxed_slice() };
        let payload = Payload {
            data: crate::buffer::PayloadData::Bytes(b"frame"),
            meta: Meta::default(),
            control: Some(&cb),
        };
        q.submit(&payload, 1).unwrap();
        assert_eq!(dev.controls_seen(), 1);
    }

    #[test]
    fn release_breaks_the_link_and_makes_handles_inert() {
        let dev = Arc::new(FakeDevice::new());
        let mut q = capture_queue(&dev, 2);
        q.stream_on().unwrap();
        dev.complete_capture(1);
        let dq = q.dequeue_ready().unwrap();
        let client = q.client().unwrap();

        q.stream_off().unwrap();
        q.release_buffers().unwrap();
        assert!(client.lock().is_none());
        // A late release attempt is a no-op rather than a crash.
        if let Some(core) = client.lock() {
            core.recycle(dq.wire.index);
        }
        // Plane memory stays valid while the handle's copies are alive.
        assert!(dq.planes[0].len() > 0);
    }
}
