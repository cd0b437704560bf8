//! PCI vendor/device quirk detection.
//!
//! Everything about actually touching PCI configuration space is a binding concern (see the
//! `hal` module doc comment); this module only maps a `(vendor_id, device_id)` pair to the hints
//! a binding needs to act on before and during [`crate::UsbXhci::init`].

/// Hints a binding folds into [`crate::ControllerQuirks`] and acts on around controller bring-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciQuirkHints {
    /// Qemu/KVM's emulated xHCI controller (Red Hat, device 0x0194) mishandles a handful of
    /// timing-sensitive sequences real hardware tolerates; `ControllerQuirks::qemu_quirk` softens
    /// those (see its doc comment in `controller`).
    pub qemu_quirk: bool,
    /// This is one of Intel's controllers that boots in EHCI mode and must be switched over to
    /// xHCI by writing its USB3 Port Routing registers before the xHCI BAR is usable. The actual
    /// register dance (read config offset 0xDC into 0xD8, 0xD4 into 0xD0, then sleep 5 seconds)
    /// happens in PCI configuration space this core has no access to; a binding must perform it
    /// itself before calling `UsbXhci::init` when this hint is set.
    pub intel_ehci_xhci_switch: bool,
}

/// Looks up known quirky controllers by PCI vendor/device ID. Unrecognized IDs get no quirks.
pub fn quirks_for_pci_id(vendor_id: u16, device_id: u16) -> PciQuirkHints {
    match (vendor_id, device_id) {
        // Intel Panther Point (and the broader Series 7/C216 chipset family shares this ID):
        // boots exposing EHCI, needs an explicit port hand-off to xHCI.
        (0x8086, 0x8C31) => PciQuirkHints {
            qemu_quirk: false,
            intel_ehci_xhci_switch: true,
        },
        // QEMU's `qemu-xhci` / `nec-usb-xhci` emulated device.
        (0x1033, 0x0194) => PciQuirkHints {
            qemu_quirk: true,
            intel_ehci_xhci_switch: false,
        },
        _ => PciQuirkHints::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intel_panther_point_needs_ehci_switch() {
        let hints = quirks_for_pci_id(0x8086, 0x8C31);
        assert!(hints.intel_ehci_xhci_switch);
        assert!(!hints.qemu_quirk);
    }

    #[test]
    fn qemu_device_sets_qemu_quirk() {
        let hints = quirks_for_pci_id(0x1033, 0x0194);
        assert!(hints.qemu_quirk);
        assert!(!hints.intel_ehci_xhci_switch);
    }

    #[test]
    fn unknown_vendor_gets_no_quirks() {
        let hints = quirks_for_pci_id(0x1234, 0x5678);
        assert_eq!(hints, PciQuirkHints::default());
    }
}
