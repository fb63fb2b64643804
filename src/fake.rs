//! Scripted in-memory device double. Implements the full device seam over
//! plain heap buffers so the queue layer can be driven through every
//! hostile scenario without hardware.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::buffer::PlaneBuf;
use crate::device::{
    ControlBlock, Device, DeviceEvent, Direction, EventSupport, FormatDesc, FourCc, MemoryKind,
    PlaneGeometry, Readiness, SlotGeometry, StopOutcome, WireBuffer, WireFlags,
};
use crate::errors::{Error, Result};

fn di(dir: Direction) -> usize {
    match dir {
        Direction::Output => 0,
        Direction::Capture => 1,
    }
}

#[derive(Default)]
struct Inner {
    formats: [FormatDesc; 2],
    registered: [u32; 2],
    streaming: [bool; 2],
    /// Buffers the device currently owns, oldest first.
    owned: [VecDeque<WireBuffer>; 2],
    /// Finished buffers ready for dequeue.
    done: [VecDeque<WireBuffer>; 2],
    events: VecDeque<DeviceEvent>,
    support: EventSupport,
    stop_supported: bool,
    /// Echo mode: every submitted output buffer consumes one capture slot
    /// and completes it with the same timestamp.
    echo: bool,
    /// Output timestamps waiting for a capture slot in echo mode.
    backlog: VecDeque<u64>,
    /// Emit an empty (end-of-stream) capture completion once the backlog
    /// is worked off.
    eos_pending: bool,
    /// Depth of the driver's own submission queue; full means backpressure.
    output_queue_cap: Option<usize>,
    grant_override: [Option<u32>; 2],
    min_buffers: u32,
    /// Device-enforced floor on the output buffer size.
    min_sizeimage: u32,
    /// Pretend the requested pixel format is unsupported on this direction.
    reject_dir: Option<Direction>,
    frame_bytes: u32,
    next_flags: VecDeque<WireFlags>,
    controls_seen: usize,
    sequence: u32,
    idle_waits: u32,
}

pub(crate) struct FakeDevice {
    inner: Mutex<Inner>,
}

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice {
            inner: Mutex::new(Inner {
                support: EventSupport { source_change: true, eos: true },
                stop_supported: true,
                echo: true,
                frame_bytes: 256,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Script controls.

    pub fn set_echo(&self, on: bool) {
        self.lock().echo = on;
    }

    pub fn set_event_support(&self, support: EventSupport) {
        self.lock().support = support;
    }

    pub fn set_stop_supported(&self, on: bool) {
        self.lock().stop_supported = on;
    }

    pub fn set_output_queue_cap(&self, cap: usize) {
        self.lock().output_queue_cap = Some(cap);
    }

    pub fn set_grant(&self, dir: Direction, count: u32) {
        self.lock().grant_override[di(dir)] = Some(count);
    }

    pub fn set_min_buffers(&self, n: u32) {
        self.lock().min_buffers = n;
    }

    pub fn set_min_sizeimage(&self, n: u32) {
        self.lock().min_sizeimage = n;
    }

    pub fn set_reject(&self, dir: Direction) {
        self.lock().reject_dir = Some(dir);
    }

    pub fn set_device_format(&self, dir: Direction, fmt: FormatDesc) {
        self.lock().formats[di(dir)] = fmt;
    }

    pub fn push_event(&self, ev: DeviceEvent) {
        self.lock().events.push_back(ev);
    }

    /// Flags to stamp on the next scripted or echoed completion.
    pub fn flag_next_completion(&self, flags: WireFlags) {
        self.lock().next_flags.push_back(flags);
    }

    /// Completes the oldest device-owned capture slot with `timestamp`.
    pub fn complete_capture(&self, timestamp: u64) {
        let mut inner = self.lock();
        let bytes = inner.frame_bytes;
        inner.finish_capture(timestamp, bytes);
    }

    /// Zero-length completion: the wire-level end-of-stream marker.
    pub fn complete_capture_empty(&self) {
        let mut inner = self.lock();
        inner.finish_capture(0, 0);
    }

    /// Marks the oldest device-owned output buffer as consumed.
    pub fn finish_output(&self) {
        let mut inner = self.lock();
        if let Some(wire) = inner.owned[0].pop_front() {
            inner.done[0].push_back(wire);
        }
    }

    pub fn capture_owned(&self) -> usize {
        self.lock().owned[1].len()
    }

    pub fn output_owned(&self) -> usize {
        self.lock().owned[0].len()
    }

    pub fn controls_seen(&self) -> usize {
        self.lock().controls_seen
    }

    pub fn is_streaming(&self, dir: Direction) -> bool {
        self.lock().streaming[di(dir)]
    }
}

impl Inner {
    fn finish_capture(&mut self, timestamp: u64, bytesused: u32) {
        let Some(mut wire) = self.owned[1].pop_front() else {
            return;
        };
        wire.timestamp = timestamp;
        self.sequence += 1;
        wire.sequence = self.sequence;
        wire.flags = self.next_flags.pop_front().unwrap_or_default();
        for p in &mut wire.planes {
            p.bytesused = 0;
        }
        if let Some(p) = wire.planes.first_mut() {
            p.bytesused = bytesused.min(p.length);
        }
        self.done[1].push_back(wire);
    }

    /// Echo-mode progress: pair waiting output timestamps with capture
    /// slots, then emit a pending end-of-stream marker.
    fn pump(&mut self) {
        if !self.echo {
            return;
        }
        while !self.backlog.is_empty() && !self.owned[1].is_empty() {
            let ts = self.backlog.pop_front().unwrap();
            let bytes = self.frame_bytes;
            self.finish_capture(ts, bytes);
        }
        if self.eos_pending && self.backlog.is_empty() && !self.owned[1].is_empty() {
            self.eos_pending = false;
            self.finish_capture(0, 0);
        }
    }
}

impl Device for FakeDevice {
    fn try_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc> {
        let inner = self.lock();
        let mut out = fmt.clone();
        if inner.reject_dir == Some(dir) {
            out.pixelformat = FourCc::from_bytes(*b"none");
            return Ok(out);
        }
        if let Some(p) = out.planes.first_mut()
            && dir == Direction::Output
            && p.sizeimage < inner.min_sizeimage
        {
            p.sizeimage = inner.min_sizeimage;
        }
        Ok(out)
    }

    fn set_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc> {
        let granted = self.try_format(dir, fmt)?;
        self.lock().formats[di(dir)] = granted.clone();
        Ok(granted)
    }

    fn format(&self, dir: Direction) -> Result<FormatDesc> {
        Ok(self.lock().formats[di(dir)].clone())
    }

    fn request_buffers(&self, dir: Direction, _memory: MemoryKind, count: u32) -> Result<u32> {
        let mut inner = self.lock();
        let d = di(dir);
        if count == 0 {
            inner.registered[d] = 0;
            inner.owned[d].clear();
            inner.done[d].clear();
            return Ok(0);
        }
        let granted = inner.grant_override[d].unwrap_or(count);
        inner.registered[d] = granted;
        Ok(granted)
    }

    fn query_buffer(&self, dir: Direction, index: u32) -> Result<SlotGeometry> {
        let inner = self.lock();
        let d = di(dir);
        if index >= inner.registered[d] {
            return Err(Error::os(libc::EINVAL));
        }
        let length = inner.formats[d].primary_size().max(64);
        let mut geom = SlotGeometry::default();
        geom.planes.push(PlaneGeometry { length, mem_offset: 0 });
        Ok(geom)
    }

    fn map_plane(
        &self,
        _dir: Direction,
        _index: u32,
        _plane: usize,
        geom: &PlaneGeometry,
    ) -> Result<PlaneBuf> {
        Ok(PlaneBuf::heap(geom.length as usize))
    }

    fn queue(&self, dir: Direction, buf: &WireBuffer, control: Option<&ControlBlock>) -> Result<()> {
        let mut inner = self.lock();
        let d = di(dir);
        if buf.index >= inner.registered[d] {
            return Err(Error::os(libc::EINVAL));
        }
        if control.is_some() {
            inner.controls_seen += 1;
        }
        if dir == Direction::Output {
            if let Some(cap) = inner.output_queue_cap
                && inner.owned[0].len() >= cap
            {
                return Err(Error::Backpressure);
            }
            let ts = buf.timestamp;
            if inner.echo {
                // Input consumed immediately; a result appears when a
                // capture slot is free.
                inner.done[0].push_back(buf.clone());
                inner.backlog.push_back(ts);
                inner.pump();
            } else {
                inner.owned[0].push_back(buf.clone());
            }
        } else {
            inner.owned[1].push_back(buf.clone());
            inner.pump();
        }
        Ok(())
    }

    fn dequeue(&self, dir: Direction) -> Result<WireBuffer> {
        self.lock().done[di(dir)].pop_front().ok_or(Error::Empty)
    }

    fn stream_on(&self, dir: Direction) -> Result<()> {
        self.lock().streaming[di(dir)] = true;
        Ok(())
    }

    fn stream_off(&self, dir: Direction) -> Result<()> {
        let mut inner = self.lock();
        let d = di(dir);
        inner.streaming[d] = false;
        inner.owned[d].clear();
        inner.done[d].clear();
        if dir == Direction::Output {
            inner.backlog.clear();
        }
        Ok(())
    }

    fn subscribe_events(&self) -> Result<EventSupport> {
        Ok(self.lock().support)
    }

    fn next_event(&self) -> Result<Option<DeviceEvent>> {
        Ok(self.lock().events.pop_front())
    }

    fn stop_stream_cmd(&self) -> Result<StopOutcome> {
        let mut inner = self.lock();
        if !inner.stop_supported {
            return Ok(StopOutcome::Unsupported);
        }
        inner.eos_pending = true;
        inner.pump();
        Ok(StopOutcome::Started)
    }

    fn min_buffers(&self, dir: Direction) -> Result<u32> {
        match dir {
            Direction::Capture => Ok(self.lock().min_buffers),
            Direction::Output => Ok(0),
        }
    }

    fn wait(&self, wanted: Readiness, _timeout_ms: i32) -> Result<Readiness> {
        let mut inner = self.lock();
        let ready = Readiness {
            capture: wanted.capture && !inner.done[1].is_empty(),
            output: wanted.output && !inner.done[0].is_empty(),
            event: wanted.event && !inner.events.is_empty(),
        };
        if ready.any() {
            inner.idle_waits = 0;
            return Ok(ready);
        }
        // A scripted device never becomes ready on its own; fail loudly
        // instead of letting a test spin forever.
        inner.idle_waits += 1;
        if inner.idle_waits > 10_000 {
            return Err(Error::os(libc::ETIMEDOUT));
        }
        Ok(Readiness::default())
    }
}
