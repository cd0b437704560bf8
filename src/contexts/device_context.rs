//! The Device Context: a Slot Context followed by up to 31 Endpoint Contexts, addressed by
//! Device Context Index (DCI). This is the layout of both an Output Device Context (looked up
//! by slot through the DCBAA) and the embedded device context inside an Input Context.
//! See xHCI §6.2.1.

use alloc::boxed::Box;
use core::fmt::Debug;

use super::slot_context::SlotContext;
use super::{endpoint_context::EndpointContext, ContextSize};
use crate::hal::{DmaAllocError, DmaBuffer, DmaBufferFactory};

/// Device Context Index of the (bidirectional) control endpoint, entry 1.
pub const EP0_DCI: u8 = 1;

/// Highest valid Endpoint Context DCI (entries 1..=31; entry 0 is the Slot Context).
pub const MAX_ENDPOINT_DCI: u8 = 31;

/// The Device Context Index for a non-control endpoint, given its USB endpoint number (`1..=15`)
/// and direction.
pub fn endpoint_dci(endpoint_number: u8, direction_in: bool) -> u8 {
    debug_assert!((1..=15).contains(&endpoint_number));
    2 * endpoint_number + u8::from(direction_in)
}

/// Reads the Slot Context at the start of a device context whose base is `base`.
///
/// # Safety
/// `base` must point at a live device context of at least one context-entry's worth of bytes.
pub(crate) unsafe fn read_slot_context(base: *mut u8) -> SlotContext {
    base.cast::<SlotContext>().read_volatile()
}

/// # Safety
/// `base` must point at a live, writable device context.
pub(crate) unsafe fn write_slot_context(base: *mut u8, context: SlotContext) {
    base.cast::<SlotContext>().write_volatile(context);
}

/// Reads the Endpoint Context at DCI `dci` (`1..=31`) of a device context whose base is `base`,
/// with entries `context_size.bytes()` apart.
///
/// # Safety
/// `base .. base + (dci + 1) * context_size.bytes()` must be live and readable.
pub(crate) unsafe fn read_endpoint_context(
    base: *mut u8,
    context_size: ContextSize,
    dci: u8,
) -> EndpointContext {
    debug_assert!((1..=MAX_ENDPOINT_DCI).contains(&dci));
    base.add(usize::from(dci) * context_size.bytes())
        .cast::<EndpointContext>()
        .read_volatile()
}

/// # Safety
/// `base .. base + (dci + 1) * context_size.bytes()` must be live and writable.
pub(crate) unsafe fn write_endpoint_context(
    base: *mut u8,
    context_size: ContextSize,
    dci: u8,
    context: EndpointContext,
) {
    debug_assert!((1..=MAX_ENDPOINT_DCI).contains(&dci));
    base.add(usize::from(dci) * context_size.bytes())
        .cast::<EndpointContext>()
        .write_volatile(context);
}

/// An Output Device Context: a dedicated DMA page published into the DCBAA for a slot. The
/// controller writes to this page whenever it updates device/endpoint state; software only
/// reads it (with the exception of `set_slot_context`/`set_endpoint_context`, used only to seed
/// the very first Output Context before the slot is addressed).
pub struct DeviceContext {
    buffer: Box<dyn DmaBuffer>,
    context_size: ContextSize,
}

impl DeviceContext {
    pub fn new(
        factory: &dyn DmaBufferFactory,
        page_size: usize,
        context_size: ContextSize,
    ) -> Result<Self, DmaAllocError> {
        Ok(Self {
            buffer: factory.allocate(page_size)?,
            context_size,
        })
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn slot_context(&self) -> SlotContext {
        self.invalidate();
        unsafe { read_slot_context(self.buffer.virt_ptr()) }
    }

    pub fn set_slot_context(&mut self, context: SlotContext) {
        unsafe { write_slot_context(self.buffer.virt_ptr(), context) };
        self.flush();
    }

    pub fn endpoint_context(&self, dci: u8) -> EndpointContext {
        self.invalidate();
        unsafe { read_endpoint_context(self.buffer.virt_ptr(), self.context_size, dci) }
    }

    pub fn set_endpoint_context(&mut self, dci: u8, context: EndpointContext) {
        unsafe {
            write_endpoint_context(self.buffer.virt_ptr(), self.context_size, dci, context);
        }
        self.flush();
    }

    /// Flushes this page to memory. A no-op on cache-coherent platforms. Only needed for the
    /// pre-seeded Output Context; the controller-written fields are refreshed with
    /// [`invalidate`](Self::invalidate) before every read instead.
    fn flush(&self) {
        self.buffer.flush(0, self.buffer.len());
    }

    fn invalidate(&self) {
        self.buffer.invalidate(0, self.buffer.len());
    }
}

impl Debug for DeviceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let slot = self.slot_context();
        let entries = slot.context_entries().min(MAX_ENDPOINT_DCI);
        f.debug_struct("DeviceContext")
            .field("slot_context", &slot)
            .field(
                "endpoint_contexts",
                &(1..=entries)
                    .map(|dci| self.endpoint_context(dci))
                    .collect::<alloc::vec::Vec<_>>(),
            )
            .finish()
    }
}
