//! The operational register set: run/stop control, status, and the pointers to the DCBAA and
//! Command Ring. See xHCI §5.4.

use bitfield_struct::bitfield;

use super::port::PortRegisterSet;
use super::Window;

/// `USBCMD`. See xHCI §5.4.1.
#[bitfield(u32, default = false)]
pub struct UsbCommand {
    /// Run/Stop. Software sets this to start the controller once every other setup register is
    /// programmed; clearing it halts the controller within 16ms.
    pub run_stop: bool,
    /// Host Controller Reset. Self-clearing; `USBSTS.controller_not_ready` stays set until the
    /// reset finishes.
    pub host_controller_reset: bool,
    pub interrupter_enable: bool,
    pub host_system_error_enable: bool,
    #[bits(3)]
    __: u8,
    pub light_host_controller_reset: bool,
    pub controller_save_state: bool,
    pub controller_restore_state: bool,
    pub enable_wrap_event: bool,
    pub enable_u3_mfindex_stop: bool,
    #[bits(1)]
    __: u8,
    pub cem_enable: bool,
    pub extended_tbc_enable: bool,
    pub extended_tbc_trb_status_enable: bool,
    pub vtio_enable: bool,
    #[bits(15)]
    __: u32,
}

/// `USBSTS`. See xHCI §5.4.2.
#[bitfield(u32, default = false)]
pub struct UsbStatus {
    /// Set whenever `run_stop` is clear and the controller has finished any in-flight work.
    pub host_controller_halted: bool,
    #[bits(1)]
    __: u8,
    pub host_system_error: bool,
    /// Set by the controller when any interrupter's `interrupt_pending` becomes set. Write 1 to
    /// clear.
    pub event_interrupt: bool,
    /// Set on any root hub port status change. Write 1 to clear.
    pub port_change_detect: bool,
    #[bits(3)]
    __: u8,
    pub save_state_status: bool,
    pub restore_state_status: bool,
    /// Set while a Save or Restore State operation is in progress; no register but `USBSTS` may
    /// be accessed while this is set.
    pub save_restore_error: bool,
    /// Clear once `host_controller_reset` completes and the controller is ready to accept
    /// `run_stop`.
    pub controller_not_ready: bool,
    pub host_controller_error: bool,
    #[bits(19)]
    __: u32,
}

/// `PAGESIZE`. See xHCI §5.4.3. The controller's page size is `1 << (bit_index + 12)` for the
/// lowest set bit.
#[bitfield(u32, default = false)]
pub struct PageSizeRegister {
    #[bits(16)]
    pub page_size_shifted: u16,
    #[bits(16)]
    __: u16,
}

impl PageSizeRegister {
    pub fn page_size(&self) -> usize {
        1usize << (self.page_size_shifted().trailing_zeros() + 12)
    }
}

/// `CRCR`. See xHCI §5.4.5.
#[bitfield(u64, default = false)]
pub struct CommandRingControlRegister {
    /// Ring Cycle State: software's idea of the Command Ring's current Producer Cycle State.
    /// Only meaningful while writing this register; reads always return 0 here.
    pub ring_cycle_state: bool,
    /// Command Stop: write 1 to make the controller finish its current command (if any) and
    /// stop, generating a Command Completion Event with `CommandRingStoppedError`.
    pub command_stop: bool,
    /// Command Abort: like `command_stop` but does not wait for the current command to finish.
    pub command_abort: bool,
    /// Read-only: whether the controller is currently executing a command.
    pub command_ring_running: bool,
    #[bits(2)]
    __: u8,
    #[bits(58)]
    command_ring_pointer_shifted: u64,
}

impl CommandRingControlRegister {
    pub fn command_ring_pointer(&self) -> u64 {
        self.command_ring_pointer_shifted() << 6
    }

    pub fn with_command_ring_pointer(self, addr: u64) -> Self {
        debug_assert_eq!(addr & 0x3f, 0, "command ring must be 64-byte aligned");
        self.with_command_ring_pointer_shifted(addr >> 6)
    }
}

/// `CONFIG`. See xHCI §5.4.7.
#[bitfield(u32, default = false)]
pub struct ConfigureRegister {
    /// Number of device slots software intends to use; must be <= `max_device_slots`.
    pub max_device_slots_enabled: u8,
    pub u3_entry_enable: bool,
    pub configuration_information_enable: bool,
    #[bits(22)]
    __: u32,
}

const USBCMD: usize = 0x00;
const USBSTS: usize = 0x04;
const PAGESIZE: usize = 0x08;
const DNCTRL: usize = 0x14;
const CRCR: usize = 0x18;
const DCBAAP: usize = 0x30;
const CONFIG: usize = 0x38;
const PORT_REGISTER_SET_BASE: usize = 0x400;
const PORT_REGISTER_SET_STRIDE: usize = 0x10;

/// The operational register set. Everything here is read/write except where noted, and every
/// write-1-to-clear field is modeled as a plain `bool` setter: callers should read-modify-write
/// exactly the bits they mean to touch, never the whole word blind, since most of `USBSTS` and
/// all of the per-port change bits clear themselves on a 1-write.
pub struct OperationalRegisters {
    window: Window,
    max_ports: u8,
}

impl OperationalRegisters {
    /// # Safety
    /// `window` must point at the controller's real operational register block, and `max_ports`
    /// must be `HCSPARAMS1.max_ports`.
    pub(crate) unsafe fn new(window: Window, max_ports: u8) -> Self {
        Self { window, max_ports }
    }

    pub fn command(&self) -> UsbCommand {
        UsbCommand::from(self.window.read32(USBCMD))
    }

    pub fn set_command(&self, value: UsbCommand) {
        self.window.write32(USBCMD, value.into());
    }

    pub fn status(&self) -> UsbStatus {
        UsbStatus::from(self.window.read32(USBSTS))
    }

    pub fn set_status(&self, value: UsbStatus) {
        self.window.write32(USBSTS, value.into());
    }

    pub fn page_size(&self) -> usize {
        PageSizeRegister::from(self.window.read32(PAGESIZE)).page_size()
    }

    /// `DNCTRL`: which of the 16 Device Notification types the controller should report as
    /// events rather than silently ignore. This core only enables Function Wake (bit 1).
    pub fn set_device_notification_control(&self, mask: u16) {
        self.window.write32(DNCTRL, u32::from(mask));
    }

    pub fn command_ring_control(&self) -> CommandRingControlRegister {
        CommandRingControlRegister::from(self.window.read64(CRCR))
    }

    pub fn set_command_ring_control(&self, value: CommandRingControlRegister) {
        self.window.write64(CRCR, value.into());
    }

    pub fn device_context_base_address_array_pointer(&self) -> u64 {
        self.window.read64(DCBAAP) & !0x3f
    }

    pub fn set_device_context_base_address_array_pointer(&self, addr: u64) {
        debug_assert_eq!(addr & 0x3f, 0, "DCBAA must be 64-byte aligned");
        self.window.write64(DCBAAP, addr);
    }

    pub fn configure(&self) -> ConfigureRegister {
        ConfigureRegister::from(self.window.read32(CONFIG))
    }

    pub fn set_configure(&self, value: ConfigureRegister) {
        self.window.write32(CONFIG, value.into());
    }

    /// Root hub port `n`, 1-indexed as in the rest of this crate (matching Slot Context's `Root
    /// Hub Port Number` field and `PortStatusChangeTrb::port_id`).
    pub fn port(&self, port: u8) -> PortRegisterSet {
        assert!(port >= 1 && port <= self.max_ports, "port {port} out of range");
        let offset = PORT_REGISTER_SET_BASE + usize::from(port - 1) * PORT_REGISTER_SET_STRIDE;
        PortRegisterSet::new(self.window.sub_window(offset))
    }

    pub fn max_ports(&self) -> u8 {
        self.max_ports
    }
}
