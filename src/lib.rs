//! Core driver for USB xHCI (eXtensible Host Controller Interface, revision 1.2) host
//! controllers. See the [XHCI spec] for more info.
//!
//! This crate implements the ring-based command/transfer/event protocol between software
//! and the controller, the per-slot/per-endpoint state machines that govern USB device
//! enumeration and data transfer, and the concurrency discipline that links an interrupt
//! handler to asynchronous command completion and USB request completion.
//!
//! Everything that would otherwise come from the surrounding OS driver framework - bind/unbind
//! events, PCI probing, the packaged USB request type, a thread pool - is named as a small set
//! of collaborator traits in [`hal`]. The rest of this crate only depends on those traits plus
//! `core`/`alloc`.
//!
//! [XHCI spec]: https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

extern crate alloc;

pub mod hal;
pub mod error;

mod registers;
mod trb;
mod rings;
mod contexts;
mod dma;
mod blocking;
mod dcbaa;
mod port_state;
mod device_state;
mod executor;
mod interrupter;
mod enumerator;
mod control_pipeline;
mod normal_pipeline;
mod endpoint;
mod hub;
mod controller;
mod quirks;

pub use controller::{UsbXhci, ControllerQuirks, HostControllerApi};
pub use error::XhciError;
pub use hal::{Bti, DmaBuffer, DmaBufferFactory, Mmio, MsiInterrupt, Timer, UsbBusClient, UsbRequest, UsbRequestHeader, DmaChunk, UsbSpeed};
pub use port_state::PortState;
pub use device_state::{DeviceState, HubInfo, TtInfo};
pub use quirks::quirks_for_pci_id;

/// The maximum number of device slots this core will manage, excluding the two virtual
/// root-hub slots (see [`HostControllerApi::max_device_count`]).
pub const MAX_SLOTS: usize = 255;
/// The maximum number of root hub ports this core will track [`PortState`] for.
pub const MAX_PORTS: usize = 255;
/// The number of transfer rings per device slot: one control ring (index 0) plus 31 non-control
/// endpoint rings (indices 1..=31, addressed as `ep_address / 2 - 1`).
pub const ENDPOINTS_PER_SLOT: usize = 32;
