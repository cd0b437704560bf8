//! The capability register set: fixed-function, read-only parameters describing what the
//! controller supports. See xHCI §5.3.

use bitfield_struct::bitfield;

use crate::contexts::ContextSize;

use super::Window;

/// `HCSPARAMS1`. See xHCI §5.3.3.
#[bitfield(u32, default = false)]
pub struct StructuralParameters1 {
    /// Number of Device Slots (and DCBAA/doorbell array entries) this controller supports.
    pub max_device_slots: u8,
    #[bits(11)]
    pub max_interrupters: u16,
    #[bits(5)]
    __: u8,
    /// Number of root hub port registers. Port numbers are 1-indexed up to this value.
    pub max_ports: u8,
}

/// `HCSPARAMS2`. See xHCI §5.3.4.
#[bitfield(u32, default = false)]
pub struct StructuralParameters2 {
    /// Scheduling threshold: how many frames (high bit set) or microframes (clear) ahead of the
    /// current position software must stay when adding isochronous TRBs.
    #[bits(4)]
    pub isochronous_scheduling_threshold: u8,
    /// `log2` of the largest Event Ring Segment Table size this controller accepts.
    #[bits(4)]
    pub erst_max: u8,
    #[bits(13)]
    __: u16,
    #[bits(5)]
    max_scratchpad_buffers_hi: u16,
    pub scratchpad_restore: bool,
    #[bits(5)]
    max_scratchpad_buffers_lo: u16,
}

impl StructuralParameters2 {
    /// Number of scratchpad buffer pointers software must place in the first entries of the
    /// DCBAA, and back with real pages, before starting the controller.
    pub fn max_scratchpad_buffers(&self) -> u16 {
        (self.max_scratchpad_buffers_hi() << 5) | self.max_scratchpad_buffers_lo()
    }
}

/// `HCCPARAMS1`. See xHCI §5.3.6.
#[bitfield(u32, default = false)]
pub struct CapabilityParameters1 {
    /// If clear, the controller only understands 32-bit physical addresses; every DMA buffer
    /// and context this core hands it must come from memory below the 4 GiB line.
    pub addressing_capability_64bit: bool,
    pub bandwidth_negotiation: bool,
    /// Whether Device/Input Contexts use the 64-byte layout instead of 32-byte.
    #[bits(1)]
    pub context_size: ContextSize,
    pub port_power_control: bool,
    pub port_indicators: bool,
    pub light_reset_capability: bool,
    pub latency_tolerance_messaging: bool,
    no_secondary_stream_id_support: bool,
    pub parses_all_event_data: bool,
    pub stopped_short_packet_capability: bool,
    pub stopped_edtla_capability: bool,
    pub contiguous_frame_id_capability: bool,
    #[bits(4)]
    max_primary_stream_array_size_exponent: u8,
    /// Offset, in 32-bit words from the start of this MMIO window, of the first extended
    /// capability entry. Zero means there are none.
    pub extended_capabilities_pointer: u16,
}

impl CapabilityParameters1 {
    pub fn secondary_stream_id_support(&self) -> bool {
        !self.no_secondary_stream_id_support()
    }

    pub fn max_primary_stream_array_size(&self) -> Option<u32> {
        match self.max_primary_stream_array_size_exponent() {
            0 => None,
            exp => Some(1u32 << (u32::from(exp) + 1)),
        }
    }
}

/// `HCCPARAMS2`. See xHCI §5.3.9.
#[bitfield(u32, default = false)]
pub struct CapabilityParameters2 {
    pub u3_entry_capability: bool,
    pub configure_endpoint_command_max_exit_latency_too_large_capability: bool,
    pub force_save_context_capability: bool,
    pub compliance_transition_capability: bool,
    pub large_esit_payload_capability: bool,
    pub configuration_information_capability: bool,
    pub extended_tbc_capability: bool,
    pub extended_tbc_trb_status_capability: bool,
    pub get_set_extended_property_capability: bool,
    pub virtualization_based_trusted_io_capability: bool,
    #[bits(22)]
    __: u32,
}

/// Read-only fixed-function registers at the base of the controller's MMIO BAR.
pub struct CapabilityRegisters {
    window: Window,
}

const CAPLENGTH: usize = 0x00;
const HCIVERSION: usize = 0x02;
const HCSPARAMS1: usize = 0x04;
const HCSPARAMS2: usize = 0x08;
const HCSPARAMS3: usize = 0x0c;
const HCCPARAMS1: usize = 0x10;
const DBOFF: usize = 0x14;
const RTSOFF: usize = 0x18;
const HCCPARAMS2: usize = 0x1c;

impl CapabilityRegisters {
    /// # Safety
    /// `window` must point at the start of a real xHCI capability register block.
    pub(crate) unsafe fn new(window: Window) -> Self {
        Self { window }
    }

    /// Length of the capability register block in bytes; the operational registers begin this
    /// many bytes after `window`'s base.
    pub fn capability_register_length(&self) -> u8 {
        (self.window.read32(CAPLENGTH) & 0xff) as u8
    }

    /// Interface version, as `(major, minor, revision)`, decoded from the BCD `HCIVERSION` field.
    pub fn version(&self) -> (u8, u8, u8) {
        let bits = (self.window.read32(CAPLENGTH) >> 16) as u16;
        (
            ((bits >> 8) & 0xf) as u8,
            ((bits >> 4) & 0xf) as u8,
            (bits & 0xf) as u8,
        )
    }

    pub fn structural_parameters_1(&self) -> StructuralParameters1 {
        StructuralParameters1::from(self.window.read32(HCSPARAMS1))
    }

    pub fn structural_parameters_2(&self) -> StructuralParameters2 {
        StructuralParameters2::from(self.window.read32(HCSPARAMS2))
    }

    /// U1/U2 device exit latency, `(u1_micros, u2_micros)`. See xHCI §5.3.5.
    pub fn structural_parameters_3(&self) -> (u8, u16) {
        let bits = self.window.read32(HCSPARAMS3);
        ((bits & 0xff) as u8, ((bits >> 8) & 0xffff) as u16)
    }

    pub fn capability_parameters_1(&self) -> CapabilityParameters1 {
        CapabilityParameters1::from(self.window.read32(HCCPARAMS1))
    }

    pub fn capability_parameters_2(&self) -> CapabilityParameters2 {
        CapabilityParameters2::from(self.window.read32(HCCPARAMS2))
    }

    /// Byte offset of the Doorbell Array from this window's base.
    pub fn doorbell_offset(&self) -> usize {
        (self.window.read32(DBOFF) & !0b11) as usize
    }

    /// Byte offset of the Runtime Registers from this window's base.
    pub fn runtime_register_space_offset(&self) -> usize {
        (self.window.read32(RTSOFF) & !0b1_1111) as usize
    }

    /// Reads one 32-bit dword of the extended capability list at `byte_offset` from this
    /// window's base (i.e. from the start of the capability register block, not from
    /// `extended_capabilities_pointer`).
    pub fn extended_capability_dword(&self, byte_offset: usize) -> u32 {
        self.window.read32(byte_offset)
    }

    /// Writes one 32-bit dword of the extended capability list at `byte_offset`.
    pub fn set_extended_capability_dword(&self, byte_offset: usize, value: u32) {
        self.window.write32(byte_offset, value);
    }
}

/// `xECP` capability IDs this core cares about. See xHCI §7.2, Table 7-1.
pub const XECP_ID_USB_LEGACY_SUPPORT: u8 = 1;
pub const XECP_ID_SUPPORTED_PROTOCOL: u8 = 2;

/// One entry of the extended capability linked list: its capability ID and the byte offset of
/// the next entry (`None` if this is the last one).
#[derive(Debug, Clone, Copy)]
pub struct ExtendedCapabilityEntry {
    pub id: u8,
    pub byte_offset: usize,
    next_offset: usize,
}

impl ExtendedCapabilityEntry {
    pub fn next_byte_offset(&self) -> Option<usize> {
        if self.next_offset == 0 {
            None
        } else {
            Some(self.next_offset)
        }
    }
}

/// Walks the extended capability list starting from `HCCPARAMS1.extended_capabilities_pointer`,
/// calling `visit` with each entry's ID and byte offset. Used by `BiosHandoff` to find the USB
/// Legacy Support capability; stops as soon as `visit` returns `false` or the list ends.
pub fn walk_extended_capabilities(caps: &CapabilityRegisters, mut visit: impl FnMut(ExtendedCapabilityEntry) -> bool) {
    let mut offset = usize::from(caps.capability_parameters_1().extended_capabilities_pointer()) * 4;
    if offset == 0 {
        return;
    }
    loop {
        let dword = caps.extended_capability_dword(offset);
        let id = (dword & 0xff) as u8;
        let next = ((dword >> 8) & 0xff) as usize;
        let entry = ExtendedCapabilityEntry {
            id,
            byte_offset: offset,
            next_offset: if next == 0 { 0 } else { offset + next * 4 },
        };
        let keep_going = visit(entry);
        match entry.next_byte_offset() {
            Some(next_offset) if keep_going => offset = next_offset,
            _ => break,
        }
    }
}
