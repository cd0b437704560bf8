//! The doorbell register array. A write here is how software tells the controller "there's a new
//! TRB for you to look at" on a given ring. See xHCI §5.6.

use bitfield_struct::bitfield;

use super::Window;

/// Which ring a doorbell write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellTarget {
    /// Doorbell 0 only: rings the Command Ring.
    CommandRing,
    /// A non-zero doorbell's control endpoint (endpoint 0) transfer ring.
    ControlEndpoint,
    /// A non-zero doorbell's OUT endpoint transfer ring. `1..=15`, matching `endpoint_id / 2`.
    OutEndpoint(u8),
    /// A non-zero doorbell's IN endpoint transfer ring. `1..=15`.
    InEndpoint(u8),
    Reserved(u8),
    VendorDefined(u8),
}

impl DoorbellTarget {
    const fn to_byte(self) -> u8 {
        match self {
            Self::CommandRing => 0,
            Self::ControlEndpoint => 1,
            Self::OutEndpoint(ep) => ep * 2,
            Self::InEndpoint(ep) => ep * 2 + 1,
            Self::Reserved(v) => v,
            Self::VendorDefined(v) => v,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits as u8 {
            0 => Self::CommandRing,
            1 => Self::ControlEndpoint,
            b if b <= 31 && b % 2 == 0 => Self::OutEndpoint(b / 2),
            b if b <= 31 => Self::InEndpoint(b / 2),
            b if b >= 248 => Self::VendorDefined(b),
            b => Self::Reserved(b),
        }
    }

    const fn into_bits(self) -> u32 {
        self.to_byte() as u32
    }
}

/// A single doorbell register entry, indexed by slot ID (entry 0 is the host controller's own
/// Command Ring doorbell).
#[bitfield(u32, default = false)]
pub struct DoorbellArrayEntry {
    #[bits(8)]
    pub target: DoorbellTarget,
    #[bits(8)]
    __: u8,
    /// Stream ID, when the target endpoint has streams enabled. Always 0 in this core (streams
    /// are not implemented).
    pub stream_id: u16,
}

const ENTRY_STRIDE: usize = 0x04;

/// The doorbell array: `max_device_slots + 1` 32-bit registers.
pub struct DoorbellRegisters {
    window: Window,
}

impl DoorbellRegisters {
    /// # Safety
    /// `window` must point at the controller's real doorbell array.
    pub(crate) unsafe fn new(window: Window) -> Self {
        Self { window }
    }

    /// Rings the Command Ring doorbell (entry 0), telling the controller a new command TRB is
    /// available.
    pub fn ring_command_ring(&self) {
        self.window
            .write32(0, DoorbellArrayEntry::new().with_target(DoorbellTarget::CommandRing).into());
    }

    /// Rings `slot_id`'s doorbell for the given endpoint, telling the controller a new transfer
    /// TRB is available on that endpoint's ring.
    pub fn ring_endpoint(&self, slot_id: u8, target: DoorbellTarget) {
        debug_assert_ne!(slot_id, 0);
        self.window.write32(
            usize::from(slot_id) * ENTRY_STRIDE,
            DoorbellArrayEntry::new().with_target(target).into(),
        );
    }
}
