//! Video4Linux memory-to-memory backend: drives a stateful codec exposed
//! as a character device through the queue layer's device seam.

mod probe;
pub mod sys;

pub use probe::{open_first, video_nodes};

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use log::{debug, trace, warn};
use nix::errno::Errno;

use crate::buffer::PlaneBuf;
use crate::device::{
    ControlBlock, Device, DeviceEvent, Direction, EventSupport, FormatDesc, FourCc, MemoryKind,
    PlaneFormat, PlaneGeometry, Readiness, SlotGeometry, StopOutcome, WireBuffer, WireFlags,
    WirePlane,
};
use crate::errors::{Error, Result};

/// An open memory-to-memory video device node.
pub struct V4l2Device {
    file: File,
    /// Multi-planar queue API, decided by the device capabilities.
    mplane: bool,
}

fn errno_to_error(e: Errno) -> Error {
    Error::os(e as i32)
}

/// Runs an ioctl, retrying interrupted calls.
fn retry_eintr<F>(mut f: F) -> nix::Result<libc::c_int>
where
    F: FnMut() -> nix::Result<libc::c_int>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

impl V4l2Device {
    /// Opens a device node and verifies it is a streaming m2m device.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        let fd = file.as_raw_fd();

        let mut cap: sys::v4l2_capability = unsafe { std::mem::zeroed() };
        retry_eintr(|| unsafe { sys::vidioc_querycap(fd, &mut cap) }).map_err(errno_to_error)?;

        let caps = if cap.device_caps != 0 { cap.device_caps } else { cap.capabilities };
        let mplane = caps & sys::V4L2_CAP_VIDEO_M2M_MPLANE != 0;
        if !mplane && caps & sys::V4L2_CAP_VIDEO_M2M == 0 {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} is not a memory-to-memory device",
                path.display()
            ))));
        }
        if caps & sys::V4L2_CAP_STREAMING == 0 {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} does not support streaming I/O",
                path.display()
            ))));
        }

        debug!("opened {} (mplane={mplane})", path.display());
        Ok(V4l2Device { file, mplane })
    }

    pub fn driver_reports_mplane(&self) -> bool {
        self.mplane
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn buf_type(&self, dir: Direction) -> u32 {
        match (dir, self.mplane) {
            (Direction::Output, true) => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            (Direction::Output, false) => sys::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            (Direction::Capture, true) => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
            (Direction::Capture, false) => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        }
    }

    fn fmt_to_sys(&self, dir: Direction, fmt: &FormatDesc) -> sys::v4l2_format {
        let mut out = sys::v4l2_format::zeroed(self.buf_type(dir));
        if self.mplane {
            let pix_mp = unsafe { &mut out.fmt.pix_mp };
            pix_mp.width = fmt.width;
            pix_mp.height = fmt.height;
            pix_mp.pixelformat = fmt.pixelformat.0;
            pix_mp.num_planes = fmt.planes.len().max(1) as u8;
            for (i, p) in fmt.planes.iter().enumerate() {
                pix_mp.plane_fmt[i].sizeimage = p.sizeimage;
                pix_mp.plane_fmt[i].bytesperline = p.bytesperline;
            }
        } else {
            let pix = unsafe { &mut out.fmt.pix };
            pix.width = fmt.width;
            pix.height = fmt.height;
            pix.pixelformat = fmt.pixelformat.0;
            if let Some(p) = fmt.planes.first() {
                pix.sizeimage = p.sizeimage;
                pix.bytesperline = p.bytesperline;
            }
        }
        out
    }

    fn fmt_from_sys(&self, raw: &sys::v4l2_format) -> FormatDesc {
        let mut fmt = FormatDesc::default();
        if self.mplane {
            let pix_mp = unsafe { &raw.fmt.pix_mp };
            fmt.width = pix_mp.width;
            fmt.height = pix_mp.height;
            fmt.pixelformat = FourCc(pix_mp.pixelformat);
            for i in 0..pix_mp.num_planes.min(sys::VIDEO_MAX_PLANES as u8) as usize {
                fmt.planes.push(PlaneFormat {
                    sizeimage: pix_mp.plane_fmt[i].sizeimage,
                    bytesperline: pix_mp.plane_fmt[i].bytesperline,
                });
            }
        } else {
            let pix = unsafe { &raw.fmt.pix };
            fmt.width = pix.width;
            fmt.height = pix.height;
            fmt.pixelformat = FourCc(pix.pixelformat);
            fmt.planes.push(PlaneFormat {
                sizeimage: pix.sizeimage,
                bytesperline: pix.bytesperline,
            });
        }
        fmt
    }

    fn memory_to_sys(memory: MemoryKind) -> u32 {
        match memory {
            MemoryKind::Mmap => sys::V4L2_MEMORY_MMAP,
            MemoryKind::External => sys::V4L2_MEMORY_DMABUF,
        }
    }

    fn subscribe(&self, type_: u32) -> bool {
        let sub = sys::v4l2_event_subscription { type_, id: 0, flags: 0, reserved: [0; 5] };
        match retry_eintr(|| unsafe { sys::vidioc_subscribe_event(self.fd(), &sub) }) {
            Ok(_) => true,
            Err(e) => {
                debug!("event {type_} subscription refused: {e}");
                false
            }
        }
    }
}

/// Splits a tracking key across the timeval the wire carries; drivers echo
/// it back untouched.
fn key_to_timeval(key: u64) -> libc::timeval {
    libc::timeval {
        tv_sec: (key / 1_000_000) as libc::time_t,
        tv_usec: (key % 1_000_000) as libc::suseconds_t,
    }
}

fn key_from_timeval(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}

impl Device for V4l2Device {
    fn try_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc> {
        let mut raw = self.fmt_to_sys(dir, fmt);
        retry_eintr(|| unsafe { sys::vidioc_try_fmt(self.fd(), &mut raw) })
            .map_err(errno_to_error)?;
        Ok(self.fmt_from_sys(&raw))
    }

    fn set_format(&self, dir: Direction, fmt: &FormatDesc) -> Result<FormatDesc> {
        let mut raw = self.fmt_to_sys(dir, fmt);
        retry_eintr(|| unsafe { sys::vidioc_s_fmt(self.fd(), &mut raw) })
            .map_err(errno_to_error)?;
        Ok(self.fmt_from_sys(&raw))
    }

    fn format(&self, dir: Direction) -> Result<FormatDesc> {
        let mut raw = sys::v4l2_format::zeroed(self.buf_type(dir));
        retry_eintr(|| unsafe { sys::vidioc_g_fmt(self.fd(), &mut raw) })
            .map_err(errno_to_error)?;
        Ok(self.fmt_from_sys(&raw))
    }

    fn request_buffers(&self, dir: Direction, memory: MemoryKind, count: u32) -> Result<u32> {
        let mut req = sys::v4l2_requestbuffers {
            count,
            type_: self.buf_type(dir),
            memory: Self::memory_to_sys(memory),
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        retry_eintr(|| unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) })
            .map_err(errno_to_error)?;
        Ok(req.count)
    }

    fn query_buffer(&self, dir: Direction, index: u32) -> Result<SlotGeometry> {
        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { std::mem::zeroed() };
        let mut buf = sys::v4l2_buffer::zeroed(self.buf_type(dir), sys::V4L2_MEMORY_MMAP);
        buf.index = index;
        if self.mplane {
            buf.length = sys::VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }
        retry_eintr(|| unsafe { sys::vidioc_querybuf(self.fd(), &mut buf) })
            .map_err(errno_to_error)?;

        let mut geom = SlotGeometry::default();
        if self.mplane {
            // In the multi-planar API buf.length is the plane count.
            for plane in planes.iter().take(buf.length as usize) {
                if plane.length == 0 {
                    continue;
                }
                geom.planes.push(PlaneGeometry {
                    length: plane.length,
                    mem_offset: unsafe { plane.m.mem_offset },
                });
            }
        } else {
            geom.planes.push(PlaneGeometry {
                length: buf.length,
                mem_offset: unsafe { buf.m.offset },
            });
        }
        Ok(geom)
    }

    fn map_plane(
        &self,
        _dir: Direction,
        _index: u32,
        _plane: usize,
        geom: &PlaneGeometry,
    ) -> Result<PlaneBuf> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                geom.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                geom.mem_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let nn = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::Io(std::io::Error::other("mmap returned null")))?;
        Ok(unsafe { PlaneBuf::mapped(nn, geom.length as usize) })
    }

    fn queue(&self, dir: Direction, wire: &WireBuffer, control: Option<&ControlBlock>) -> Result<()> {
        if let Some(c) = control {
            // Control payloads ride the media-request API, which this
            // backend does not speak; builders targeting it plug in their
            // own device.
            trace!("ignoring {} byte control block for {:?}", c.data.len(), c.codec);
        }

        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { std::mem::zeroed() };
        let external = wire.planes.iter().any(|p| p.fd.is_some());
        let memory = if external { sys::V4L2_MEMORY_DMABUF } else { sys::V4L2_MEMORY_MMAP };
        let mut buf = sys::v4l2_buffer::zeroed(self.buf_type(dir), memory);
        buf.index = wire.index;
        buf.timestamp = key_to_timeval(wire.timestamp);

        if self.mplane {
            for (i, p) in wire.planes.iter().enumerate() {
                planes[i].bytesused = p.bytesused;
                planes[i].length = p.length;
                if let Some(fd) = p.fd {
                    planes[i].m.fd = fd;
                }
            }
            buf.length = wire.planes.len() as u32;
            buf.m.planes = planes.as_mut_ptr();
        } else if let Some(p) = wire.planes.first() {
            buf.bytesused = p.bytesused;
            buf.length = p.length;
            if let Some(fd) = p.fd {
                buf.m.fd = fd;
            }
        }

        match retry_eintr(|| unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) }) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => Err(Error::Backpressure),
            Err(e) => {
                warn!("{dir} queue of slot {} failed: {e}", wire.index);
                Err(errno_to_error(e))
            }
        }
    }

    fn dequeue(&self, dir: Direction) -> Result<WireBuffer> {
        let mut planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES] = unsafe { std::mem::zeroed() };
        let mut buf = sys::v4l2_buffer::zeroed(self.buf_type(dir), sys::V4L2_MEMORY_MMAP);
        if self.mplane {
            buf.length = sys::VIDEO_MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }

        match retry_eintr(|| unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) }) {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Err(Error::Empty),
            // The driver's way of saying the stream has stopped.
            Err(Errno::EPIPE) => return Err(Error::EndOfStream),
            Err(e) => return Err(errno_to_error(e)),
        }

        let mut wire = WireBuffer {
            index: buf.index,
            timestamp: key_from_timeval(buf.timestamp),
            sequence: buf.sequence,
            flags: WireFlags {
                last: buf.flags & sys::V4L2_BUF_FLAG_LAST != 0,
                error: buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0,
            },
            planes: Default::default(),
        };
        if self.mplane {
            for plane in planes.iter().take(buf.length as usize) {
                if plane.length == 0 {
                    continue;
                }
                wire.planes.push(WirePlane {
                    bytesused: plane.bytesused,
                    length: plane.length,
                    fd: None,
                });
            }
        } else {
            wire.planes.push(WirePlane { bytesused: buf.bytesused, length: buf.length, fd: None });
        }
        Ok(wire)
    }

    fn stream_on(&self, dir: Direction) -> Result<()> {
        let type_ = self.buf_type(dir) as libc::c_int;
        retry_eintr(|| unsafe { sys::vidioc_streamon(self.fd(), &type_) })
            .map_err(errno_to_error)?;
        Ok(())
    }

    fn stream_off(&self, dir: Direction) -> Result<()> {
        let type_ = self.buf_type(dir) as libc::c_int;
        retry_eintr(|| unsafe { sys::vidioc_streamoff(self.fd(), &type_) })
            .map_err(errno_to_error)?;
        Ok(())
    }

    fn subscribe_events(&self) -> Result<EventSupport> {
        Ok(EventSupport {
            source_change: self.subscribe(sys::V4L2_EVENT_SOURCE_CHANGE),
            eos: self.subscribe(sys::V4L2_EVENT_EOS),
        })
    }

    fn next_event(&self) -> Result<Option<DeviceEvent>> {
        let mut ev = sys::v4l2_event::zeroed();
        match retry_eintr(|| unsafe { sys::vidioc_dqevent(self.fd(), &mut ev) }) {
            Ok(_) => {}
            Err(Errno::EAGAIN) | Err(Errno::ENOENT) => return Ok(None),
            Err(e) => return Err(errno_to_error(e)),
        }
        match ev.type_ {
            sys::V4L2_EVENT_SOURCE_CHANGE => Ok(Some(DeviceEvent::SourceChange)),
            sys::V4L2_EVENT_EOS => Ok(Some(DeviceEvent::EndOfStream)),
            other => {
                debug!("ignoring event type {other}");
                Ok(None)
            }
        }
    }

    fn stop_stream_cmd(&self) -> Result<StopOutcome> {
        let mut dec: sys::v4l2_decoder_cmd = unsafe { std::mem::zeroed() };
        dec.cmd = sys::V4L2_DEC_CMD_STOP;
        match retry_eintr(|| unsafe { sys::vidioc_decoder_cmd(self.fd(), &mut dec) }) {
            Ok(_) => return Ok(StopOutcome::Started),
            Err(Errno::ENOTTY) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(errno_to_error(e)),
        }

        let mut enc: sys::v4l2_encoder_cmd = unsafe { std::mem::zeroed() };
        enc.cmd = sys::V4L2_ENC_CMD_STOP;
        match retry_eintr(|| unsafe { sys::vidioc_encoder_cmd(self.fd(), &mut enc) }) {
            Ok(_) => Ok(StopOutcome::Started),
            Err(Errno::ENOTTY) | Err(Errno::EINVAL) => Ok(StopOutcome::Unsupported),
            Err(e) => Err(errno_to_error(e)),
        }
    }

    fn min_buffers(&self, dir: Direction) -> Result<u32> {
        if dir != Direction::Capture {
            return Ok(0);
        }
        let mut ctrl = sys::v4l2_control { id: sys::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, value: 0 };
        match retry_eintr(|| unsafe { sys::vidioc_g_ctrl(self.fd(), &mut ctrl) }) {
            Ok(_) => Ok(ctrl.value.max(0) as u32),
            Err(_) => Ok(0),
        }
    }

    fn wait(&self, wanted: Readiness, timeout_ms: i32) -> Result<Readiness> {
        let mut events: libc::c_short = 0;
        if wanted.capture {
            events |= libc::POLLIN | libc::POLLRDNORM;
        }
        if wanted.output {
            events |= libc::POLLOUT | libc::POLLWRNORM;
        }
        if wanted.event {
            events |= libc::POLLPRI;
        }

        let mut pfd = libc::pollfd { fd: self.fd(), events, revents: 0 };
        let ret = loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::Io(err));
            }
            break ret;
        };

        if ret == 0 {
            return Ok(Readiness::default());
        }

        let revents = pfd.revents;
        let ready = Readiness {
            capture: revents & (libc::POLLIN | libc::POLLRDNORM) != 0,
            output: revents & (libc::POLLOUT | libc::POLLWRNORM) != 0,
            event: revents & libc::POLLPRI != 0,
        };
        if !ready.any() && revents & libc::POLLERR != 0 {
            warn!("poll reported POLLERR with no readiness");
            return Err(Error::os(libc::EIO));
        }
        Ok(ready)
    }
}
