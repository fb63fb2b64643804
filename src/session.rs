//! Ties a submit (output) queue and a completion (capture) queue to one
//! device and runs the two state machines that make stateful codecs
//! hostile: mid-stream resolution changes and end-of-stream drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::buffer::{Frame, Payload, SubmitReport};
use crate::device::{
    CodecKind, Device, DeviceEvent, Direction, EventSupport, FormatDesc, MemoryKind, Readiness,
    StopOutcome,
};
use crate::errors::{Error, Result};
use crate::queue::{Dequeued, Queue};
use crate::track::{DEFAULT_TRACK_ENTRIES, Lookup, Meta, MetadataTracker, PtsStats};

/// Usable buffer size for a compressed stream of the given dimensions.
pub fn coded_frame_size(width: u32, height: u32) -> u32 {
    (width * height * 3 / 2) / 2 + 128
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Streaming,
    /// A resolution change arrived while the device still owned capture
    /// slots; reinit runs once they drain.
    ResizePending,
    Draining,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Format submitted on the output queue (codec fourcc and coded size
    /// for a decoder, raw format for an encoder).
    pub output_format: FormatDesc,
    /// Capture format to request; `None` accepts whatever the device
    /// currently reports.
    pub capture_format: Option<FormatDesc>,
    pub num_output_buffers: u32,
    /// Capture buffers on top of the device-reported minimum.
    pub capture_headroom: u32,
    pub output_memory: MemoryKind,
    /// Required for devices without resolution-change events: the caller
    /// accepts that dimensions are fixed for the session's lifetime.
    pub fixed_dimensions: bool,
    pub track_entries: usize,
    /// Floor for the output buffer size; 0 derives one from the coded
    /// dimensions.
    pub min_output_buffer_size: u32,
}

impl SessionConfig {
    /// Decoder defaults for one codec at the given coded dimensions.
    pub fn decoder(codec: CodecKind, width: u32, height: u32) -> Self {
        SessionConfig {
            output_format: FormatDesc::single_plane(codec.fourcc(), width, height, 0),
            capture_format: None,
            num_output_buffers: 16,
            capture_headroom: 8,
            output_memory: MemoryKind::Mmap,
            fixed_dimensions: false,
            track_entries: DEFAULT_TRACK_ENTRIES,
            min_output_buffer_size: 0,
        }
    }
}

/// One streaming session over a memory-to-memory device.
///
/// Purely synchronous: nothing here spawns threads, `send` never blocks
/// and `recv` blocks at most for its timeout. The only cross-thread
/// traffic is frame handles being dropped elsewhere, which the queues
/// absorb through their weak links.
pub struct Session<D: Device> {
    dev: Arc<D>,
    output: Queue<D>,
    capture: Queue<D>,
    state: SessionState,
    track: MetadataTracker,
    stats: PtsStats,
    events: EventSupport,
    capture_headroom: u32,
}

impl<D: Device> Session<D> {
    pub fn new(dev: D, config: SessionConfig) -> Result<Self> {
        let dev = Arc::new(dev);

        let events = dev.subscribe_events()?;
        if !events.source_change && !config.fixed_dimensions {
            return Err(Error::SourceChangeUnsupported);
        }

        let mut output = Queue::new(Arc::clone(&dev), Direction::Output, config.output_memory);
        let mut capture = Queue::new(Arc::clone(&dev), Direction::Capture, MemoryKind::Mmap);

        let min_size = if config.min_output_buffer_size > 0 {
            config.min_output_buffer_size
        } else {
            coded_frame_size(config.output_format.width, config.output_format.height)
        };
        output.negotiate(&config.output_format, min_size)?;
        let out_granted = output.allocate_buffers(config.num_output_buffers)?;

        match &config.capture_format {
            Some(fmt) => {
                capture.negotiate(fmt, 0)?;
            }
            None => {
                let fmt = dev.format(Direction::Capture)?;
                capture.adopt_format(fmt);
            }
        }
        let cap_count = dev.min_buffers(Direction::Capture).unwrap_or(0) + config.capture_headroom;
        let cap_granted = capture.allocate_buffers(cap_count)?;

        // The ring must stay ahead of the deepest possible pipeline or
        // completions start aliasing keys.
        let floor = 2 * (out_granted + cap_granted) as usize;
        let entries = config.track_entries.max(floor);
        if entries != config.track_entries {
            debug!("metadata ring grown to {entries} for {} buffers", out_granted + cap_granted);
        }

        output.stream_on()?;
        capture.stream_on()?;

        Ok(Session {
            dev,
            output,
            capture,
            state: SessionState::Streaming,
            track: MetadataTracker::new(entries),
            stats: PtsStats::new(),
            events,
            capture_headroom: config.capture_headroom,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output_format(&self) -> FormatDesc {
        self.output.format()
    }

    pub fn capture_format(&self) -> FormatDesc {
        self.capture.format()
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Submits one payload. Never blocks: `Err(Backpressure)` asks the
    /// caller to `recv` and retry. An empty byte payload is the drain
    /// marker and switches the session into draining.
    pub fn send(&mut self, payload: &Payload) -> Result<SubmitReport> {
        match self.state {
            SessionState::Stopped | SessionState::Draining => return Err(Error::EndOfStream),
            SessionState::Streaming | SessionState::ResizePending => {}
        }

        if payload.data.is_empty() {
            self.begin_drain()?;
            return Ok(SubmitReport::default());
        }

        let key = self.track.add(payload.meta);
        match self.output.submit(payload, key) {
            Ok(report) => Ok(report),
            Err(e) => {
                // The entry will never complete; retries re-add.
                self.track.cancel(key);
                Err(e)
            }
        }
    }

    fn begin_drain(&mut self) -> Result<()> {
        match self.dev.stop_stream_cmd() {
            Ok(StopOutcome::Started) => {}
            Ok(StopOutcome::Unsupported) => {
                debug!("no drain command; stopping the output queue instead");
                self.output.stream_off()?;
            }
            Err(e) => return Err(e),
        }
        debug!("draining");
        self.state = SessionState::Draining;
        Ok(())
    }

    /// Retrieves the next completed frame, in device-completion order.
    ///
    /// `timeout_ms` semantics: 0 polls and returns immediately, a positive
    /// value bounds the wait, negative blocks until something happens.
    /// Even a negative timeout returns `Err(Empty)` when progress needs
    /// the caller: every capture slot is held externally, or the device
    /// freed an input slot and wants more data.
    pub fn recv(&mut self, timeout_ms: i32) -> Result<Frame<D>> {
        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            if self.state == SessionState::Stopped {
                return Err(Error::EndOfStream);
            }

            if self.capture.done() {
                // Next dequeue can only say end-of-stream. During a resize
                // that is the signal to rebuild the capture side.
                if self.state == SessionState::ResizePending {
                    self.reinit_capture()?;
                    continue;
                }
                self.finalize();
                return Err(Error::EndOfStream);
            }

            if self.state == SessionState::ResizePending && self.capture.queued_count() == 0 {
                self.reinit_capture()?;
                continue;
            }

            let draining = self.state == SessionState::Draining;
            let wanted = Readiness {
                capture: self.capture.is_streaming() && self.capture.queued_count() > 0,
                output: timeout_ms < 0
                    && self.output.is_streaming()
                    && !draining
                    && self.output.queued_count() > 0,
                event: self.events.source_change || self.events.eos,
            };

            if !wanted.capture && !wanted.output {
                if !wanted.event {
                    return Err(Error::Empty);
                }
                if self.capture.is_streaming() {
                    // The device owns no capture slot; only the caller can
                    // change that (drop a frame, feed input). Check the
                    // event channel once before handing control back.
                    let ready =
                        self.dev.wait(Readiness { event: true, ..Default::default() }, 0)?;
                    if !ready.event {
                        return Err(Error::Empty);
                    }
                    if self.handle_events()? {
                        return Err(Error::EndOfStream);
                    }
                    continue;
                }
                // Capture stopped: wait for the geometry event below.
            }

            let iter_timeout = match deadline {
                Some(d) => {
                    let rem = d.saturating_duration_since(Instant::now()).as_millis() as i32;
                    if rem == 0 {
                        return Err(Error::Empty);
                    }
                    rem
                }
                None if timeout_ms < 0 => 3000,
                None => 0,
            };

            let ready = self.dev.wait(wanted, iter_timeout)?;

            if !ready.any() {
                match deadline {
                    _ if timeout_ms < 0 => {
                        debug!("still waiting on {wanted:?}");
                        continue;
                    }
                    Some(_) => continue, // deadline check above decides
                    None => return Err(Error::Empty),
                }
            }

            if ready.event && self.handle_events()? {
                return Err(Error::EndOfStream);
            }

            if ready.capture {
                match self.capture.dequeue_ready() {
                    Ok(dq) => {
                        if let Some(frame) = self.resolve(dq)? {
                            return Ok(frame);
                        }
                        continue; // flushed frame dropped
                    }
                    Err(Error::Empty) => continue,
                    Err(Error::EndOfStream) => continue, // handled at loop top
                    Err(e) => return Err(e),
                }
            }

            if ready.output {
                self.output.reclaim();
                if timeout_ms < 0 {
                    // An input slot came free; let the caller pump.
                    return Err(Error::Empty);
                }
            }
        }
    }

    /// Turns a dequeued capture buffer into a frame, or drops it when its
    /// metadata says it predates a flush.
    fn resolve(&mut self, dq: Dequeued) -> Result<Option<Frame<D>>> {
        let meta = match self.track.lookup(dq.wire.timestamp) {
            Lookup::Exact(meta) => meta,
            Lookup::Mismatch(degraded) => degraded,
            Lookup::Discarded => {
                // Dropping the handle recycles the slot to the device.
                drop(self.wrap(dq, Meta::default())?);
                return Ok(None);
            }
        };
        self.stats.add(meta.pts);
        self.wrap(dq, meta).map(Some)
    }

    fn wrap(&mut self, dq: Dequeued, meta: Meta) -> Result<Frame<D>> {
        let link = self.capture.client().ok_or(Error::ShutDown)?;
        if dq.wire.flags.error {
            warn!("device flagged buffer {} as errored; delivering as corrupted", dq.wire.index);
        }
        let mut bytesused = ArrayVec::new();
        for p in &dq.wire.planes {
            bytesused.push(p.bytesused);
        }
        Ok(Frame {
            meta,
            best_effort_pts: meta.pts.or_else(|| self.stats.guess()),
            corrupted: dq.wire.flags.error,
            sequence: dq.wire.sequence,
            index: dq.wire.index,
            planes: dq.planes,
            bytesused,
            link,
        })
    }

    /// Drains the out-of-band event queue. Returns true when the session
    /// reached end of stream.
    fn handle_events(&mut self) -> Result<bool> {
        while let Some(ev) = self.dev.next_event()? {
            match ev {
                DeviceEvent::EndOfStream => {
                    debug!("end-of-stream event");
                    self.finalize();
                    return Ok(true);
                }
                DeviceEvent::SourceChange => self.on_source_change()?,
            }
        }
        Ok(false)
    }

    fn on_source_change(&mut self) -> Result<()> {
        let new_fmt = self.dev.format(Direction::Capture)?;
        let cur = self.capture.format();
        let changed = !self.capture.has_pool() || !cur.same_resolution(&new_fmt);
        debug!(
            "source change: {}x{} -> {}x{} (reinit={changed})",
            cur.width, cur.height, new_fmt.width, new_fmt.height
        );

        if !changed {
            // Same geometry; bounce the stream to acknowledge.
            self.capture.stream_off()?;
            self.capture.stream_on()?;
            if self.state == SessionState::Draining {
                self.state = SessionState::Streaming;
            }
            return Ok(());
        }

        if self.capture.queued_count() == 0 {
            self.reinit_capture()
        } else {
            debug!(
                "resize deferred: device still owns {} capture slots",
                self.capture.queued_count()
            );
            self.state = SessionState::ResizePending;
            Ok(())
        }
    }

    /// Rebuilds the capture side against the device's current format. The
    /// output queue is untouched.
    fn reinit_capture(&mut self) -> Result<()> {
        self.capture.stream_off()?;
        self.capture.release_buffers()?;

        let fmt = self.dev.format(Direction::Capture)?;
        debug!("capture reinit to {} {}x{}", fmt.pixelformat, fmt.width, fmt.height);
        self.capture.adopt_format(fmt);

        let count =
            self.dev.min_buffers(Direction::Capture).unwrap_or(0) + self.capture_headroom;
        self.capture.allocate_buffers(count)?;
        self.capture.stream_on()?;

        if self.state != SessionState::Draining {
            self.state = SessionState::Streaming;
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if self.state != SessionState::Stopped {
            debug!("session stopped");
            self.state = SessionState::Stopped;
        }
    }

    /// Flushes both queues and invalidates in-flight metadata, leaving the
    /// session ready for new input (e.g. after a seek).
    pub fn flush(&mut self) -> Result<()> {
        self.output.stream_off()?;
        self.capture.stream_off()?;
        self.track.discard_all();
        self.state = SessionState::Streaming;
        self.output.stream_on()?;
        self.capture.stream_on()?;
        Ok(())
    }

    /// Orderly teardown: stop both streams, orphan outstanding frame
    /// handles and release the device's buffer sets. Never waits on the
    /// device or on consumers.
    pub fn end(&mut self) -> Result<()> {
        self.state = SessionState::Stopped;
        self.output.stream_off()?;
        self.capture.stream_off()?;
        self.output.release_buffers()?;
        self.capture.release_buffers()?;
        Ok(())
    }

    /// Capture frames currently held by the consumer.
    pub fn frames_in_flight(&self) -> usize {
        self.capture.external_count()
    }
}

impl<D: Device> Drop for Session<D> {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            debug!("teardown: {e}");
        }
    }
}
