//! The Event Ring Segment Table: the per-interrupter table describing where the controller
//! should write event TRBs. See xHCI §6.5.

use alloc::boxed::Box;

use crate::dma::alloc_checked;
use crate::error::{Result, XhciError};
use crate::hal::{DmaBuffer, DmaBufferFactory};
use crate::registers::interrupter::{EventRingSegmentTableSize, InterrupterRegisterSet};

/// One 16-byte entry: `{address, size (in TRBs), reserved}`. See xHCI Table 6-83.
#[repr(C)]
#[derive(Clone, Copy)]
struct ErstEntry {
    address: u64,
    size: u16,
    _reserved0: u16,
    _reserved1: u32,
}

impl ErstEntry {
    const fn zeroed() -> Self {
        Self {
            address: 0,
            size: 0,
            _reserved0: 0,
            _reserved1: 0,
        }
    }
}

/// The Event Ring Segment Table: a single contiguous DMA page of [`ErstEntry`]s, grown one
/// segment at a time as [`EventRing`](super::event_ring::EventRing) adds segments.
///
/// Invariant: `0 <= pressure <= segment_count <= capacity <= erst_max`. The table is only ever
/// grown while the controller is running, and `ERSTSZ` is always updated (via the interrupter
/// register handle this was built with) before the newly written entry could be touched by the
/// controller, enforced by the release barrier `DmaBuffer::flush` performs.
pub struct EventRingSegmentTable {
    buffer: Box<dyn DmaBuffer>,
    /// Max entries this table could ever reach given one DMA page and 16-byte entries.
    capacity: usize,
    /// `HCSPARAMS2.erst_max`: the controller's own ceiling on segment-table size (as an entry
    /// count, not `log2`).
    erst_max: usize,
    /// Number of entries actually written so far.
    segment_count: usize,
    /// Segments added but not yet reclaimed by [`remove_pressure`](Self::remove_pressure). The
    /// table itself never shrinks; pressure is purely a bookkeeping counter for the owning
    /// [`EventRing`](super::event_ring::EventRing) to decide whether it's safe to stop growing.
    pressure: usize,
}

impl EventRingSegmentTable {
    /// Allocates the (empty) table page. No segments are registered yet; call
    /// [`add_segment`](Self::add_segment) once per [`EventRing`](super::event_ring::EventRing)
    /// segment.
    pub fn init(
        page_size: usize,
        erst_max_log2: u8,
        is_32bit: bool,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        let buffer = alloc_checked(factory, page_size, is_32bit)?;
        let capacity = page_size / core::mem::size_of::<ErstEntry>();
        let erst_max = if erst_max_log2 == 0 {
            usize::MAX
        } else {
            1usize << erst_max_log2
        };
        Ok(Self {
            buffer,
            capacity,
            erst_max,
            segment_count: 0,
            pressure: 0,
        })
    }

    pub fn base_address(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Writes the next table entry for a new page-sized event-ring segment at
    /// `segment_phys_addr`, then programs `ERSTSZ` on `interrupter` to the new segment count.
    pub fn add_segment(
        &mut self,
        segment_phys_addr: u64,
        trbs_per_segment: u16,
        interrupter: &InterrupterRegisterSet,
    ) -> Result<()> {
        if self.segment_count >= self.capacity {
            return Err(XhciError::NoMemory);
        }
        if self.segment_count >= self.erst_max || self.pressure > self.segment_count {
            return Err(XhciError::BadState);
        }

        let entry = ErstEntry {
            address: segment_phys_addr,
            size: trbs_per_segment,
            ..ErstEntry::zeroed()
        };
        let entry_offset = self.segment_count * core::mem::size_of::<ErstEntry>();
        // SAFETY: `entry_offset` is within the allocated page; `entry` is a valid ERST entry.
        unsafe {
            self.buffer
                .virt_ptr()
                .add(entry_offset)
                .cast::<ErstEntry>()
                .write_volatile(entry);
        }
        self.buffer.flush(entry_offset, core::mem::size_of::<ErstEntry>());

        self.segment_count += 1;
        self.pressure += 1;

        interrupter.set_event_ring_segment_table_size(
            EventRingSegmentTableSize::new().with_segment_table_entries(self.segment_count as u16),
        );

        Ok(())
    }

    /// Releases one unit of growth pressure. The table's storage is never shrunk; this only lets
    /// the owning [`EventRing`] account for segments it no longer considers "recently added".
    pub fn remove_pressure(&mut self) {
        self.pressure = self.pressure.saturating_sub(1);
    }
}
