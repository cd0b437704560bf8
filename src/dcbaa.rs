//! The Device Context Base Address Array and the scratchpad buffer array it points slot 0 at.
//! See xHCI §6.1/§4.20.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::dma::alloc_checked;
use crate::error::Result;
use crate::hal::{DmaBuffer, DmaBufferFactory};

const ENTRY_SIZE: usize = 8;

/// A page of 64-bit physical pointers indexed by slot ID: `dcbaa[0]` is the scratchpad-buffer-array
/// pointer (or 0 if the controller needs none); `dcbaa[1..=max_slots]` are Output Context
/// pointers, published by [`DeviceState`](crate::device_state::DeviceState) as each slot is
/// addressed.
pub struct Dcbaa {
    buffer: Box<dyn DmaBuffer>,
    has_coherent_cache: bool,
    /// Kept alive for the controller's lifetime; entries never move once allocated (a contiguous
    /// block of `max_scratchpad_buffers` page-sized buffers).
    _scratchpad_buffers: Vec<Box<dyn DmaBuffer>>,
}

impl Dcbaa {
    /// Allocates the DCBAA page and, if `max_scratchpad_buffers > 0`, the scratchpad array and
    /// its backing buffers, wiring `dcbaa[0]` to the array's physical address.
    pub fn init(
        page_size: usize,
        max_slots: usize,
        max_scratchpad_buffers: u16,
        is_32bit: bool,
        has_coherent_cache: bool,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        let buffer = alloc_checked(factory, page_size, is_32bit)?;
        let _ = max_slots; // entry count is bounded by the page itself; see `set_output_context`.

        let mut scratchpad_buffers = Vec::new();
        if max_scratchpad_buffers > 0 {
            let array = alloc_checked(factory, page_size, is_32bit)?;
            for i in 0..max_scratchpad_buffers {
                let pad = alloc_checked(factory, page_size, is_32bit)?;
                let offset = usize::from(i) * ENTRY_SIZE;
                unsafe {
                    array.virt_ptr().add(offset).cast::<u64>().write_volatile(pad.phys_addr());
                }
                scratchpad_buffers.push(pad);
            }
            array.flush(0, usize::from(max_scratchpad_buffers) * ENTRY_SIZE);
            if !has_coherent_cache {
                for pad in &scratchpad_buffers {
                    pad.flush(0, pad.len());
                }
            }

            unsafe {
                buffer.virt_ptr().cast::<u64>().write_volatile(array.phys_addr());
            }
            buffer.flush(0, ENTRY_SIZE);
            scratchpad_buffers.push(array);
        }

        Ok(Self {
            buffer,
            has_coherent_cache,
            _scratchpad_buffers: scratchpad_buffers,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    /// Publishes `slot`'s Output Context physical address (or 0 to clear it on `DisableSlot`).
    pub fn set_output_context(&self, slot: u8, phys_addr: u64) {
        let offset = usize::from(slot) * ENTRY_SIZE;
        unsafe {
            self.buffer.virt_ptr().add(offset).cast::<u64>().write_volatile(phys_addr);
        }
        if !self.has_coherent_cache {
            self.buffer.flush(offset, ENTRY_SIZE);
        }
    }
}
