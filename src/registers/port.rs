//! Per-port register sets (`PORTSC`/`PORTPMSC`/`PORTLI`/`PORTHLPMC`). See xHCI §5.4.8-5.4.11.

use bitfield_struct::bitfield;

use super::Window;

/// `PORTSC.PLS`: the port's current Link State. See xHCI Table 5-27 and §4.19.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLinkState {
    U0,
    U1,
    U2,
    U3,
    Disabled,
    RxDetect,
    Inactive,
    Polling,
    Recovery,
    HotReset,
    ComplianceMode,
    TestMode,
    Resume,
    Reserved(u8),
}

impl PortLinkState {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::U0,
            1 => Self::U1,
            2 => Self::U2,
            3 => Self::U3,
            4 => Self::Disabled,
            5 => Self::RxDetect,
            6 => Self::Inactive,
            7 => Self::Polling,
            8 => Self::Recovery,
            9 => Self::HotReset,
            10 => Self::ComplianceMode,
            11 => Self::TestMode,
            15 => Self::Resume,
            other => Self::Reserved(other as u8),
        }
    }

    /// Writes to `PLS` only take effect alongside the write-strobe bit, and only a handful of
    /// target values are legal (RxDetect to re-enable a USB3 port, U3 to suspend it); the ring
    /// code that wants to write one constructs the raw bits itself rather than going through
    /// this round-trip.
    const fn into_bits(self) -> u32 {
        match self {
            Self::U0 => 0,
            Self::U1 => 1,
            Self::U2 => 2,
            Self::U3 => 3,
            Self::Disabled => 4,
            Self::RxDetect => 5,
            Self::Inactive => 6,
            Self::Polling => 7,
            Self::Recovery => 8,
            Self::HotReset => 9,
            Self::ComplianceMode => 10,
            Self::TestMode => 11,
            Self::Resume => 15,
            Self::Reserved(other) => other as u32,
        }
    }
}

/// `PORTSC`. See xHCI §5.4.8.
#[bitfield(u32, default = false)]
pub struct PortStatusAndControl {
    pub current_connect_status: bool,
    /// Only the controller may set this; software may only clear it by writing `true`.
    pub port_enabled: bool,
    #[bits(1)]
    __: u8,
    pub over_current_active: bool,
    /// Write `true` to begin a reset; self-clears when the reset finishes.
    pub port_reset: bool,
    #[bits(4)]
    pub port_link_state: PortLinkState,
    pub port_power: bool,
    /// Slot Context `Speed` field encoding; see [`crate::hal::UsbSpeed::from_slot_speed`].
    #[bits(4)]
    pub port_speed: u8,
    #[bits(2)]
    pub port_indicator_control: u8,
    /// Must be set alongside a `port_link_state` write for that write to take effect.
    pub port_link_state_write_strobe: bool,
    pub connect_status_change: bool,
    pub port_enabled_change: bool,
    pub warm_port_reset_change: bool,
    pub over_current_change: bool,
    pub port_reset_change: bool,
    pub port_link_state_change: bool,
    pub port_config_error_change: bool,
    pub cold_attach_status: bool,
    pub wake_on_connect_enable: bool,
    pub wake_on_disconnect_enable: bool,
    pub wake_on_over_current_enable: bool,
    #[bits(2)]
    __: u8,
    pub device_removable: bool,
    /// Write `true` to begin a Warm Port Reset (USB3 only); self-clears.
    pub warm_port_reset: bool,
}

impl PortStatusAndControl {
    /// The four RW1C-only event bits a port status change event is generated from. Masking these
    /// out before writing `PORTSC` back (after just flipping e.g. `port_power`) avoids
    /// accidentally clearing a change the event handler hasn't observed yet.
    pub const CHANGE_BITS_MASK: u32 = (1 << 17)
        | (1 << 18)
        | (1 << 19)
        | (1 << 20)
        | (1 << 21)
        | (1 << 22)
        | (1 << 23);

    /// This register back with every write-1-to-clear bit forced to 0, safe to use as the base
    /// for a read-modify-write that must not silently clear a pending port event.
    pub fn preserving_changes(self) -> Self {
        Self::from(u32::from(self) & !Self::CHANGE_BITS_MASK)
    }
}

/// `PORTPMSC`. Layout differs by speed; this core only ever reads/writes the USB3 form (the only
/// fields it acts on: U1/U2 timeout, which it leaves at the power-on default of 0/disabled).
/// See xHCI §5.4.9.
#[bitfield(u32, default = false)]
pub struct PortPowerManagementStatusAndControl {
    pub u1_timeout: u8,
    pub u2_timeout: u8,
    pub force_link_pm_accept: bool,
    #[bits(15)]
    __: u32,
}

const PORTSC: usize = 0x00;
const PORTPMSC: usize = 0x04;
const PORTLI: usize = 0x08;
const PORTHLPMC: usize = 0x0c;

/// One root hub port's register block.
pub struct PortRegisterSet {
    window: Window,
}

impl PortRegisterSet {
    pub(crate) fn new(window: Window) -> Self {
        Self { window }
    }

    pub fn status_and_control(&self) -> PortStatusAndControl {
        PortStatusAndControl::from(self.window.read32(PORTSC))
    }

    pub fn set_status_and_control(&self, value: PortStatusAndControl) {
        self.window.write32(PORTSC, value.into());
    }

    pub fn power_management_status_and_control(&self) -> PortPowerManagementStatusAndControl {
        PortPowerManagementStatusAndControl::from(self.window.read32(PORTPMSC))
    }

    pub fn set_power_management_status_and_control(
        &self,
        value: PortPowerManagementStatusAndControl,
    ) {
        self.window.write32(PORTPMSC, value.into());
    }

    /// `PORTLI`: USB3 Port Link Info (link error count). Not acted on by this core; exposed for
    /// diagnostics.
    pub fn link_info(&self) -> u32 {
        self.window.read32(PORTLI)
    }

    /// `PORTHLPMC`: USB2 Hardware LPM Control. Not acted on by this core (LPM is negotiated by
    /// upper layers); exposed for completeness.
    pub fn hardware_lpm_control(&self) -> u32 {
        self.window.read32(PORTHLPMC)
    }
}
