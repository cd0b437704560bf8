//! The Input Context: an Input Control Context followed by an embedded Device Context, used as
//! the parameter block for `AddressDevice`, `ConfigureEndpoint`, and `EvaluateContext`.
//! See xHCI §6.2.5.

use alloc::boxed::Box;
use core::fmt::Debug;

use super::device_context::{
    read_endpoint_context, read_slot_context, write_endpoint_context, write_slot_context,
    MAX_ENDPOINT_DCI,
};
use super::{endpoint_context::EndpointContext, slot_context::SlotContext, ContextSize};
use crate::hal::{DmaAllocError, DmaBuffer, DmaBufferFactory};

/// `Input Control Context.A0`/`D0`: the Slot Context bit. Always set on `AddressDevice` along
/// with `A1` (see [`ADD_A1_EP0`]).
pub const ADD_A0_SLOT: u32 = 1 << 0;
/// `Input Control Context.A1`: EP0's Endpoint Context bit.
pub const ADD_A1_EP0: u32 = 1 << 1;

const CONTROL_CONTEXT_OFFSET: usize = 0;

/// A paged DMA region laid out as `[Input Control Context, Slot Context, Endpoint Context * 31]`,
/// each entry `context_size.bytes()` apart.
pub struct InputContext {
    buffer: Box<dyn DmaBuffer>,
    context_size: ContextSize,
}

impl InputContext {
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

    fn device_context_base(&self) -> *mut u8 {
        unsafe { self.buffer.virt_ptr().add(self.context_size.bytes()) }
    }

    pub fn control_context(&self) -> InputControlContext {
        self.invalidate();
        unsafe {
            self.buffer
                .virt_ptr()
                .add(CONTROL_CONTEXT_OFFSET)
                .cast::<InputControlContext>()
                .read_volatile()
        }
    }

    pub fn set_control_context(&mut self, context: InputControlContext) {
        unsafe {
            self.buffer
                .virt_ptr()
                .add(CONTROL_CONTEXT_OFFSET)
                .cast::<InputControlContext>()
                .write_volatile(context);
        }
        self.flush();
    }

    pub fn slot_context(&self) -> SlotContext {
        self.invalidate();
        unsafe { read_slot_context(self.device_context_base()) }
    }

    pub fn set_slot_context(&mut self, context: SlotContext) {
        unsafe { write_slot_context(self.device_context_base(), context) };
        self.flush();
    }

    pub fn endpoint_context(&self, dci: u8) -> EndpointContext {
        debug_assert!((1..=MAX_ENDPOINT_DCI).contains(&dci));
        self.invalidate();
        unsafe { read_endpoint_context(self.device_context_base(), self.context_size, dci) }
    }

    pub fn set_endpoint_context(&mut self, dci: u8, context: EndpointContext) {
        debug_assert!((1..=MAX_ENDPOINT_DCI).contains(&dci));
        unsafe {
            write_endpoint_context(self.device_context_base(), self.context_size, dci, context);
        }
        self.flush();
    }

    fn flush(&self) {
        self.buffer.flush(0, self.buffer.len());
    }

    fn invalidate(&self) {
        self.buffer.invalidate(0, self.buffer.len());
    }
}

/// `Input Control Context`: the Drop/Add Context bitmaps plus the configuration fields used by
/// `ConfigureEndpoint`. Entries 0 and 1 of the Drop/Add bitmaps are reserved (the Slot Context is
/// never dropped, and its Add bit doubles as "this command touches the slot").
/// See xHCI §6.2.5.1.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct InputControlContext {
    drop_context_flags: u32,
    add_context_flags: u32,
    _reserved: [u32; 5],
    configuration_value: u8,
    interface_number: u8,
    alternate_setting: u8,
    _reserved1: u8,
}

impl InputControlContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drop_context_flags(&self) -> u32 {
        self.drop_context_flags
    }

    pub fn with_drop_context_flags(mut self, flags: u32) -> Self {
        self.drop_context_flags = flags;
        self
    }

    pub fn add_context_flags(&self) -> u32 {
        self.add_context_flags
    }

    pub fn with_add_context_flags(mut self, flags: u32) -> Self {
        self.add_context_flags = flags;
        self
    }

    /// Sets the Drop bit for the given DCI (`2..=31`; DCI 0/1 can never be dropped).
    pub fn with_drop_endpoint(mut self, dci: u8) -> Self {
        debug_assert!((2..=MAX_ENDPOINT_DCI).contains(&dci));
        self.drop_context_flags |= 1 << dci;
        self
    }

    /// Sets the Add bit for the given DCI (`0..=31`; 0 is the Slot Context, 1 is EP0).
    pub fn with_add_endpoint(mut self, dci: u8) -> Self {
        debug_assert!(dci <= MAX_ENDPOINT_DCI);
        self.add_context_flags |= 1 << dci;
        self
    }

    pub fn configuration_value(&self) -> u8 {
        self.configuration_value
    }

    pub fn with_configuration_value(mut self, value: u8) -> Self {
        self.configuration_value = value;
        self
    }

    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    pub fn with_interface_number(mut self, value: u8) -> Self {
        self.interface_number = value;
        self
    }

    pub fn alternate_setting(&self) -> u8 {
        self.alternate_setting
    }

    pub fn with_alternate_setting(mut self, value: u8) -> Self {
        self.alternate_setting = value;
        self
    }
}

impl Debug for InputControlContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InputControlContext")
            .field("drop_context_flags", &format_args!("{:#x}", self.drop_context_flags))
            .field("add_context_flags", &format_args!("{:#x}", self.add_context_flags))
            .field("configuration_value", &self.configuration_value)
            .field("interface_number", &self.interface_number)
            .field("alternate_setting", &self.alternate_setting)
            .finish()
    }
}
