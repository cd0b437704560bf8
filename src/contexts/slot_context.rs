//! The Slot Context: the first context entry in every Input/Output Device Context, describing
//! the device as a whole rather than any particular endpoint. See xHCI §6.2.2.

use bitfield_struct::bitfield;
use core::fmt::Debug;

/// `Slot Context.Slot State`. See xHCI Table 6-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    DisabledOrEnabled,
    Default,
    Addressed,
    Configured,
    Reserved(u8),
}

impl SlotState {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::DisabledOrEnabled,
            1 => Self::Default,
            2 => Self::Addressed,
            3 => Self::Configured,
            other => Self::Reserved(other as u8),
        }
    }

    const fn into_bits(self) -> u32 {
        match self {
            Self::DisabledOrEnabled => 0,
            Self::Default => 1,
            Self::Addressed => 2,
            Self::Configured => 3,
            Self::Reserved(other) => other as u32,
        }
    }
}

#[bitfield(u32, default = false)]
struct SlotContextDword0 {
    #[bits(20)]
    route_string: u32,
    /// Slot Context `Speed` field encoding; see [`crate::hal::UsbSpeed::to_slot_speed`].
    #[bits(4)]
    speed: u8,
    #[bits(1)]
    __: u8,
    multi_tt: bool,
    is_hub: bool,
    /// Index of the last valid Endpoint Context entry in this Device Context, `1..=31`; entry 0
    /// is this Slot Context itself and entry `2n`/`2n+1` are the OUT/IN contexts of endpoint `n`.
    #[bits(5)]
    context_entries: u8,
}

#[bitfield(u32, default = false)]
struct SlotContextDword1 {
    max_exit_latency: u16,
    /// 1-indexed root hub port number this device (or its topmost ancestor hub) is attached to.
    root_hub_port_number: u8,
    /// Number of downstream ports, if this device is a hub; meaningless otherwise.
    number_of_ports: u8,
}

#[bitfield(u32, default = false)]
struct SlotContextDword2 {
    /// Slot ID of the parent high-speed hub, for Low/Full-speed devices behind a Transaction
    /// Translator. 0 if none.
    parent_hub_slot_id: u8,
    parent_port_number: u8,
    #[bits(2)]
    tt_think_time: u8,
    #[bits(4)]
    __: u8,
    #[bits(10)]
    interrupter_target: u16,
}

#[bitfield(u32, default = false)]
struct SlotContextDword3 {
    usb_device_address: u8,
    #[bits(19)]
    __: u32,
    #[bits(5)]
    slot_state: SlotState,
}

/// The _Slot Context_ data structure. See xHCI §6.2.2.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SlotContext {
    dword_0: SlotContextDword0,
    dword_1: SlotContextDword1,
    dword_2: SlotContextDword2,
    dword_3: SlotContextDword3,
}

impl SlotContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_string(&self) -> u32 {
        self.dword_0.route_string()
    }

    pub fn with_route_string(mut self, route_string: u32) -> Self {
        debug_assert_eq!(route_string >> 20, 0, "route string is only 20 bits");
        self.dword_0 = self.dword_0.with_route_string(route_string);
        self
    }

    pub fn speed(&self) -> u8 {
        self.dword_0.speed()
    }

    pub fn with_speed(mut self, speed: u8) -> Self {
        self.dword_0 = self.dword_0.with_speed(speed);
        self
    }

    pub fn multi_tt(&self) -> bool {
        self.dword_0.multi_tt()
    }

    pub fn with_multi_tt(mut self, multi_tt: bool) -> Self {
        self.dword_0 = self.dword_0.with_multi_tt(multi_tt);
        self
    }

    pub fn is_hub(&self) -> bool {
        self.dword_0.is_hub()
    }

    pub fn with_is_hub(mut self, is_hub: bool) -> Self {
        self.dword_0 = self.dword_0.with_is_hub(is_hub);
        self
    }

    pub fn context_entries(&self) -> u8 {
        self.dword_0.context_entries()
    }

    pub fn with_context_entries(mut self, context_entries: u8) -> Self {
        self.dword_0 = self.dword_0.with_context_entries(context_entries);
        self
    }

    pub fn max_exit_latency(&self) -> u16 {
        self.dword_1.max_exit_latency()
    }

    pub fn with_max_exit_latency(mut self, max_exit_latency: u16) -> Self {
        self.dword_1 = self.dword_1.with_max_exit_latency(max_exit_latency);
        self
    }

    pub fn root_hub_port_number(&self) -> u8 {
        self.dword_1.root_hub_port_number()
    }

    pub fn with_root_hub_port_number(mut self, port: u8) -> Self {
        self.dword_1 = self.dword_1.with_root_hub_port_number(port);
        self
    }

    pub fn number_of_ports(&self) -> u8 {
        self.dword_1.number_of_ports()
    }

    pub fn with_number_of_ports(mut self, ports: u8) -> Self {
        self.dword_1 = self.dword_1.with_number_of_ports(ports);
        self
    }

    pub fn parent_hub_slot_id(&self) -> u8 {
        self.dword_2.parent_hub_slot_id()
    }

    pub fn with_parent_hub_slot_id(mut self, slot_id: u8) -> Self {
        self.dword_2 = self.dword_2.with_parent_hub_slot_id(slot_id);
        self
    }

    pub fn parent_port_number(&self) -> u8 {
        self.dword_2.parent_port_number()
    }

    pub fn with_parent_port_number(mut self, port: u8) -> Self {
        self.dword_2 = self.dword_2.with_parent_port_number(port);
        self
    }

    pub fn tt_think_time(&self) -> u8 {
        self.dword_2.tt_think_time()
    }

    pub fn with_tt_think_time(mut self, tt: u8) -> Self {
        self.dword_2 = self.dword_2.with_tt_think_time(tt);
        self
    }

    pub fn interrupter_target(&self) -> u16 {
        self.dword_2.interrupter_target()
    }

    pub fn with_interrupter_target(mut self, target: u16) -> Self {
        self.dword_2 = self.dword_2.with_interrupter_target(target);
        self
    }

    pub fn usb_device_address(&self) -> u8 {
        self.dword_3.usb_device_address()
    }

    pub fn slot_state(&self) -> SlotState {
        self.dword_3.slot_state()
    }
}

impl Debug for SlotContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotContext")
            .field("route_string", &self.route_string())
            .field("speed", &self.speed())
            .field("multi_tt", &self.multi_tt())
            .field("is_hub", &self.is_hub())
            .field("context_entries", &self.context_entries())
            .field("max_exit_latency", &self.max_exit_latency())
            .field("root_hub_port_number", &self.root_hub_port_number())
            .field("number_of_ports", &self.number_of_ports())
            .field("parent_hub_slot_id", &self.parent_hub_slot_id())
            .field("parent_port_number", &self.parent_port_number())
            .field("tt_think_time", &self.tt_think_time())
            .field("interrupter_target", &self.interrupter_target())
            .field("usb_device_address", &self.usb_device_address())
            .field("slot_state", &self.slot_state())
            .finish()
    }
}
