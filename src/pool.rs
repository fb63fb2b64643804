//! Fixed-size pool of device-registered buffer slots for one queue
//! direction. Built in one shot after format negotiation, torn down in one
//! shot at queue release.

use arrayvec::ArrayVec;
use log::debug;
use triomphe::Arc;

use crate::buffer::{PlaneBuf, SlotRecord, SlotStatus};
use crate::device::{Device, Direction, MemoryKind};
use crate::errors::{Error, Result};

pub(crate) struct BufferPool {
    slots: Vec<SlotRecord>,
}

impl BufferPool {
    /// Registers `count` buffers with the device, queries the geometry it
    /// chose and maps every plane. The granted count wins over the request.
    pub fn allocate<D: Device>(
        dev: &D,
        dir: Direction,
        memory: MemoryKind,
        count: u32,
    ) -> Result<Self> {
        let granted = dev.request_buffers(dir, memory, count)?;
        if granted == 0 {
            return Err(Error::NoBuffers(dir));
        }
        if granted != count {
            debug!("{dir}: requested {count} buffers, granted {granted}");
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let geom = dev.query_buffer(dir, index)?;
            let mut planes = ArrayVec::new();
            for (pi, pg) in geom.planes.iter().enumerate() {
                let buf = match memory {
                    MemoryKind::Mmap => dev.map_plane(dir, index, pi, pg)?,
                    // Backing arrives per-submission; keep the geometry.
                    MemoryKind::External => PlaneBuf::external(-1, pg.length as usize),
                };
                planes.push(Arc::new(buf));
            }
            slots.push(SlotRecord { index, status: SlotStatus::Available, planes });
        }

        Ok(BufferPool { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_mut(&mut self, index: u32) -> Option<&mut SlotRecord> {
        self.slots.get_mut(index as usize)
    }

    pub fn acquire_free(&mut self) -> Option<&mut SlotRecord> {
        self.slots.iter_mut().find(|s| s.status == SlotStatus::Available)
    }

    /// Stream-off discards device-side work: every Queued slot goes back to
    /// Available. Returns how many were flushed.
    pub fn flush_queued(&mut self) -> usize {
        let mut n = 0;
        for s in &mut self.slots {
            if s.status == SlotStatus::Queued {
                s.status = SlotStatus::Available;
                n += 1;
            }
        }
        n
    }

    pub fn available_indices(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Available)
            .map(|s| s.index)
            .collect()
    }

    pub fn external_count(&self) -> usize {
        self.slots.iter().filter(|s| s.status == SlotStatus::External).count()
    }
}
