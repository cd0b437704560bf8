//! Typed views over the controller's MMIO register windows.
//!
//! Every register set here is a thin offset calculation over the [`Mmio`](crate::hal::Mmio) the
//! binding crate hands to [`crate::UsbXhci::init`]; nothing in this module assumes how that
//! window is mapped. Field layouts are built with `bitfield-struct` so that a register value read
//! off the wire has a typed accessor per field rather than the caller hand-rolling shifts and
//! masks.

use alloc::sync::Arc;

use crate::hal::Mmio;

pub mod capability;
pub mod doorbell;
pub mod interrupter;
pub mod operational;
pub mod port;
pub mod runtime;

pub use capability::CapabilityRegisters;
pub use doorbell::DoorbellRegisters;
pub use interrupter::InterrupterRegisterSet;
pub use operational::OperationalRegisters;
pub use port::PortRegisterSet;
pub use runtime::RuntimeRegisters;

/// Every register set in this module stores one of these instead of a raw pointer: the byte
/// offset of its window from the start of the controller's BAR, plus a shared handle to the
/// whole window.
#[derive(Clone)]
pub(crate) struct Window {
    mmio: Arc<dyn Mmio>,
    base: usize,
}

impl Window {
    pub(crate) fn new(mmio: Arc<dyn Mmio>, base: usize) -> Self {
        Self { mmio, base }
    }

    pub(crate) fn read32(&self, offset: usize) -> u32 {
        self.mmio.read32(self.base + offset)
    }

    pub(crate) fn write32(&self, offset: usize, value: u32) {
        self.mmio.write32(self.base + offset, value)
    }

    pub(crate) fn read64(&self, offset: usize) -> u64 {
        self.mmio.read64(self.base + offset)
    }

    pub(crate) fn write64(&self, offset: usize, value: u64) {
        self.mmio.write64(self.base + offset, value)
    }

    /// A window over a sub-range of this one, for register arrays (ports, doorbells,
    /// interrupters) laid out as fixed-stride repeats of a smaller struct.
    pub(crate) fn sub_window(&self, offset: usize) -> Self {
        Self {
            mmio: self.mmio.clone(),
            base: self.base + offset,
        }
    }
}
