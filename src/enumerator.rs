//! Device enumeration: the `EnableSlot -> SetDeviceInformation -> AddressDevice(BSR) ->
//! GetMaxPacketSize -> SetMaxPacketSize -> AddressDevice -> Online` state machine, including the
//! retry-with-BSR path taken when a device's first `SET_ADDRESS` fails in flight.
//!
//! Every step here suspends on a command completion, a USB control transfer, or a timer; none of
//! those are modeled as a general future. Each step is a plain function that, on completion,
//! calls the next step directly — the same shape as [`crate::executor`]'s continuations, just
//! specialized to the handful of suspension points this state machine actually has (xHCI command
//! completion, control-transfer completion, and a fixed delay).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::contexts::device_context::EP0_DCI;
use crate::contexts::input_context::{InputControlContext, ADD_A1_EP0};
use crate::contexts::ContextSize;
use crate::control_pipeline;
use crate::dcbaa::Dcbaa;
use crate::device_state::{DeviceState, HubInfo, SlotContextParams};
use crate::hal::{DmaBufferFactory, DmaChunk, UsbBusClient, UsbRequest, UsbRequestHeader, UsbSpeed};
use crate::port_state::PortState;
use crate::registers::doorbell::DoorbellRegisters;
use crate::rings::CommandRing;
use crate::trb::command::CommandTrb;
use crate::trb::event::CompletionCode;

/// `GET_DESCRIPTOR(Device, index=0, length=8)`: reads just `bMaxPacketSize0`, the only field the
/// enumerator needs before it can safely issue further control transfers at the negotiated packet
/// size. See USB 2.0 §9.4.3.
const GET_DEVICE_DESCRIPTOR_8: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00];

/// What [`enumerate_device`] needs back from the owning controller. Implemented by
/// [`crate::controller::UsbXhci`]; kept as a trait (the same seam [`crate::hal`] uses for the
/// outer binding) so this module never names the controller's concrete layout.
pub trait EnumerationHost: Send + Sync {
    fn factory(&self) -> &dyn DmaBufferFactory;
    fn page_size(&self) -> usize;
    fn context_size(&self) -> ContextSize;
    fn is_32bit(&self) -> bool;
    fn has_coherent_cache(&self) -> bool;
    fn command_ring(&self) -> &CommandRing;
    fn dcbaa(&self) -> &Dcbaa;
    fn doorbells(&self) -> &DoorbellRegisters;
    fn device_state(&self, slot_id: u8) -> &DeviceState;
    fn port_state(&self, port: u8) -> &PortState;
    /// Negotiated link speed for `port`, read off `PORTSC` by the caller before enumeration
    /// started (root-hub ports only; a device behind a hub inherits its speed from the port
    /// status change the hub itself reported, which the caller already resolved).
    fn port_speed(&self, port: u8) -> UsbSpeed;
    /// Schedules `task` to run on the interrupter's executor after `delay_ns` nanoseconds.
    fn schedule_after_nanos(&self, delay_ns: u64, task: Box<dyn FnOnce() + Send>);
    fn bus_client(&self) -> &dyn UsbBusClient;
    /// The zero-based virtual root-hub slot `AddDevice` reports as `hub` for a device attached
    /// directly to a root port at this speed (USB 2.0 or USB 3.0 virtual hub, per
    /// `GetMaxDeviceCount`'s two extra slots).
    fn root_hub_device_id(&self, speed: UsbSpeed) -> u8;
    /// Called exactly once per [`enumerate_device`] invocation, when that port's attempt has
    /// reached a terminal state (online or abandoned) and a queued status change for the same
    /// port can now be served. The default does nothing; a controller that serializes
    /// enumeration per port overrides this to dequeue the next pending attempt.
    fn enumeration_finished(&self, port: u8) {
        let _ = port;
    }
}

/// Identifies the hub a newly attached device sits behind: which slot to address as `parent` in
/// its Slot Context, and the already-folded [`HubInfo`] (route string, TT assignment, depth) to
/// attach to its [`DeviceState`]. `None` means the device is attached directly to a root port.
#[derive(Debug, Clone, Copy)]
pub struct ParentHub {
    pub slot_id: u8,
    pub port_number: u8,
    pub info: HubInfo,
    /// The child's negotiated speed, as reported by the hub's own status-change handling (a
    /// device behind a hub has no root-hub `PORTSC` of its own for [`EnumerationHost::port_speed`]
    /// to read).
    pub speed: UsbSpeed,
}

/// The speed to enumerate at: the hub-reported speed for a device behind a hub, or the root port's
/// own `PORTSC` speed otherwise.
fn effective_speed(host: &Arc<dyn EnumerationHost>, port: u8, parent: Option<ParentHub>) -> UsbSpeed {
    parent.map(|p| p.speed).unwrap_or_else(|| host.port_speed(port))
}

struct AsyncState {
    slot: u8,
    bsr: bool,
    retry_ctx: bool,
}

/// Enumerates the device that just linked up on `port`. Fire-and-forget: failures are logged and
/// leave the port unbound (`port_state(port).slot_id() == 0`) rather than reported to a caller,
/// since nothing is synchronously waiting on a port-status-change event.
pub fn enumerate_device(host: Arc<dyn EnumerationHost>, port: u8, parent: Option<ParentHub>) {
    let state = Arc::new(Mutex::new(AsyncState {
        slot: 0,
        bsr: false,
        retry_ctx: false,
    }));
    enumerate_device_internal(host, port, parent, state);
}

fn enumerate_device_internal(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    parent: Option<ParentHub>,
    state: Arc<Mutex<AsyncState>>,
) {
    {
        let mut s = state.lock();
        if s.bsr {
            s.retry_ctx = true;
        }
    }

    let enable_host = host.clone();
    let enable_state = state.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::EnableSlot,
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "EnableSlot on port {} failed: {:?}",
                    port,
                    event.completion_code
                );
                enable_host.enumeration_finished(port);
                return;
            }
            let slot = event.slot_id;
            enable_state.lock().slot = slot;
            on_slot_enabled(enable_host, port, parent, enable_state, slot);
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post EnableSlot for port {}: {:?}", port, err);
        host.enumeration_finished(port);
    }
}

fn on_slot_enabled(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    parent: Option<ParentHub>,
    state: Arc<Mutex<AsyncState>>,
    slot: u8,
) {
    let hub_info = parent.as_ref().map(|p| p.info);
    host.device_state(slot).set_device_information(slot, port, hub_info);
    if let Some(parent) = &parent {
        host.device_state(parent.slot_id).record_hub_child(parent.port_number, slot);
    } else {
        host.port_state(port).set_slot_id(slot);
    }

    let speed = effective_speed(&host, port, parent);
    let params = SlotContextParams {
        route_string: hub_info.map_or(0, |h| h.route_string),
        speed,
        root_hub_port_number: hub_info.map_or(port, |h| h.root_hub_port_number),
        is_hub: false,
        multi_tt: false,
        parent_hub_slot_id: parent.as_ref().map_or(0, |p| p.slot_id),
        parent_port_number: parent.as_ref().map_or(0, |p| p.port_number),
        tt_think_time: 0,
    };

    let setup = host.device_state(slot).address_device_setup(
        host.factory(),
        host.page_size(),
        host.context_size(),
        host.is_32bit(),
        host.has_coherent_cache(),
        host.dcbaa(),
        params,
    );
    let input_ctx_ptr = match setup {
        Ok(ptr) => ptr,
        Err(err) => {
            log::error!("address_device_setup failed for slot {}: {:?}", slot, err);
            fail_enumeration(host, port, slot, false);
            return;
        }
    };

    let bsr = state.lock().bsr;
    post_address_device(host, port, parent, state, slot, input_ctx_ptr, bsr);
}

fn post_address_device(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    parent: Option<ParentHub>,
    state: Arc<Mutex<AsyncState>>,
    slot: u8,
    input_ctx_ptr: u64,
    bsr: bool,
) {
    let waiter_host = host.clone();
    let err_state = state.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::AddressDevice {
            slot_id: slot,
            input_ctx_ptr,
            bsr,
        },
        Box::new(move |event| {
            on_address_device_complete(waiter_host, port, parent, state, slot, event.completion_code);
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post AddressDevice for slot {}: {:?}", slot, err);
        let retry_ctx = err_state.lock().retry_ctx;
        fail_enumeration(host, port, slot, retry_ctx);
    }
}

fn on_address_device_complete(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    parent: Option<ParentHub>,
    state: Arc<Mutex<AsyncState>>,
    slot: u8,
    completion_code: CompletionCode,
) {
    let retry_ctx = state.lock().retry_ctx;
    match completion_code {
        CompletionCode::Success => {}
        CompletionCode::UsbTransactionError if !retry_ctx && host.port_state(port).is_connected() => {
            state.lock().bsr = true;
            retry_enumeration(host, port, parent, state, slot);
            return;
        }
        other => {
            log::error!("AddressDevice failed for slot {}: {:?}", slot, other);
            fail_enumeration(host, port, slot, retry_ctx);
            return;
        }
    }

    if retry_ctx {
        state.lock().retry_ctx = false;
        let get_host = host.clone();
        get_max_packet_size(
            host,
            port,
            slot,
            Box::new(move |max_packet_size| {
                let set_host = get_host.clone();
                set_max_packet_size_command(
                    get_host,
                    port,
                    slot,
                    max_packet_size,
                    Box::new(move || {
                        finalize_address_device(set_host, port, parent, slot);
                    }),
                );
            }),
        );
    } else {
        primary_tail(host, port, parent, slot);
    }
}

fn finalize_address_device(host: Arc<dyn EnumerationHost>, port: u8, parent: Option<ParentHub>, slot: u8) {
    let input_ctx_ptr = host.device_state(slot).input_context_phys();
    let finish_host = host.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::AddressDevice {
            slot_id: slot,
            input_ctx_ptr,
            bsr: false,
        },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "finalize AddressDevice failed for slot {}: {:?}",
                    slot,
                    event.completion_code
                );
                fail_enumeration(finish_host, port, slot, false);
                return;
            }
            primary_tail(finish_host, port, parent, slot);
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post finalize AddressDevice for slot {}: {:?}", slot, err);
        fail_enumeration(host, port, slot, false);
    }
}

/// Shared tail of both the non-retry path and the retry path once a slot is finally addressed
/// with `BSR=0`: wait out the USB 2.0 10 ms reset-recovery window (full/high speed only), read
/// back `bMaxPacketSize0`, push it into the Endpoint Context for Full Speed devices (their packet
/// size isn't one of the fixed defaults), then tell the bus client the device is online.
fn primary_tail(host: Arc<dyn EnumerationHost>, port: u8, parent: Option<ParentHub>, slot: u8) {
    let speed = effective_speed(&host, port, parent);
    let task_host = host.clone();
    let task = Box::new(move || {
        let get_host = task_host.clone();
        get_max_packet_size(
            task_host,
            port,
            slot,
            Box::new(move |max_packet_size| {
                if speed == UsbSpeed::Full {
                    let online_host = get_host.clone();
                    set_max_packet_size_command(
                        get_host,
                        port,
                        slot,
                        max_packet_size,
                        Box::new(move || {
                            device_online(online_host, port, parent, slot, speed);
                        }),
                    );
                } else {
                    device_online(get_host, port, parent, slot, speed);
                }
            }),
        );
    });

    if speed.is_superspeed() {
        task();
    } else {
        host.schedule_after_nanos(10_000_000, task);
    }
}

fn device_online(host: Arc<dyn EnumerationHost>, port: u8, parent: Option<ParentHub>, slot: u8, speed: UsbSpeed) {
    let device_id = slot - 1;
    let hub_device_id = match parent {
        Some(p) => p.slot_id - 1,
        None => host.root_hub_device_id(speed),
    };
    host.bus_client().add_device(device_id, hub_device_id, speed);
    host.enumeration_finished(port);
}

/// Cleans up a slot that never made it online. A no-op (besides logging) once `retry_ctx` is set
/// or the slot was never enabled — the retry path owns disabling its own stale slot via
/// [`retry_enumeration`], and there's nothing to disable if `EnableSlot` itself never completed.
fn fail_enumeration(host: Arc<dyn EnumerationHost>, port: u8, slot: u8, retry_ctx: bool) {
    host.enumeration_finished(port);
    if retry_ctx || slot == 0 {
        return;
    }
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::DisableSlot { slot_id: slot },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "cleanup DisableSlot({}) failed: {:?}",
                    slot,
                    event.completion_code
                );
            }
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post cleanup DisableSlot({}): {:?}", slot, err);
    }
}

fn retry_enumeration(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    parent: Option<ParentHub>,
    state: Arc<Mutex<AsyncState>>,
    old_slot: u8,
) {
    let retry_host = host.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::DisableSlot { slot_id: old_slot },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "retry DisableSlot({}) failed: {:?}; abandoning enumeration on port {}",
                    old_slot,
                    event.completion_code,
                    port
                );
                retry_host.enumeration_finished(port);
                return;
            }
            enumerate_device_internal(retry_host, port, parent, state);
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post retry DisableSlot({}): {:?}", old_slot, err);
    }
}

/// Issues `GET_DESCRIPTOR(Device, 8)` on `slot`'s EP0 and calls `cont` with the observed
/// `bMaxPacketSize0` (byte 7 of the descriptor).
fn get_max_packet_size(host: Arc<dyn EnumerationHost>, port: u8, slot: u8, cont: Box<dyn FnOnce(u16) + Send>) {
    let factory = host.factory();
    let buffer = match crate::dma::alloc_checked(factory, 8, host.is_32bit()) {
        Ok(buffer) => buffer,
        Err(err) => {
            log::error!("failed to allocate descriptor buffer for slot {}: {:?}", slot, err);
            fail_enumeration(host, port, slot, false);
            return;
        }
    };
    let phys_addr = buffer.phys_addr();
    let has_coherent_cache = host.has_coherent_cache();
    let complete_host = host.clone();

    let request = UsbRequest {
        header: UsbRequestHeader {
            device_id: slot - 1,
            ep_address: 0,
            length: 8,
            frame: 0,
        },
        setup: Some(GET_DEVICE_DESCRIPTOR_8),
        chunks: vec![DmaChunk { phys_addr, len: 8 }],
        complete: Box::new(move |status, transferred| {
            if !has_coherent_cache {
                buffer.invalidate(0, 8);
            }
            match status {
                Ok(()) if transferred >= 8 => {
                    // SAFETY: `buffer` is 8 bytes long and was just invalidated (or is coherent).
                    let bytes = unsafe { core::slice::from_raw_parts(buffer.virt_ptr(), 8) };
                    cont(u16::from(bytes[7]));
                }
                Ok(()) => {
                    log::error!(
                        "short GET_DESCRIPTOR(Device,8) reply on slot {}: {} bytes",
                        slot,
                        transferred
                    );
                    fail_enumeration(complete_host, port, slot, false);
                }
                Err(err) => {
                    log::error!("GET_DESCRIPTOR(Device,8) failed on slot {}: {:?}", slot, err);
                    fail_enumeration(complete_host, port, slot, false);
                }
            }
        }),
    };

    let device_state = host.device_state(slot);
    if let Err(err) = control_pipeline::queue_control_request(device_state, slot, factory, host.doorbells(), request) {
        log::error!("failed to queue GET_DESCRIPTOR(Device,8) on slot {}: {:?}", slot, err);
        fail_enumeration(host, port, slot, false);
    }
}

/// Stamps `max_packet_size` into EP0's Endpoint Context via `EvaluateContext`, then calls `cont`.
fn set_max_packet_size_command(
    host: Arc<dyn EnumerationHost>,
    port: u8,
    slot: u8,
    max_packet_size: u16,
    cont: Box<dyn FnOnce() + Send>,
) {
    let input_ctx_ptr = host.device_state(slot).begin_input(|input| {
        input.set_control_context(InputControlContext::new().with_add_context_flags(ADD_A1_EP0));
        let ep0 = input.endpoint_context(EP0_DCI).with_max_packet_size(max_packet_size);
        input.set_endpoint_context(EP0_DCI, ep0);
    });
    let input_ctx_ptr = match input_ctx_ptr {
        Ok(ptr) => ptr,
        Err(err) => {
            log::error!("begin_input failed for slot {}: {:?}", slot, err);
            fail_enumeration(host, port, slot, false);
            return;
        }
    };

    let cont_host = host.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::EvaluateContext { slot_id: slot, input_ctx_ptr },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "SetMaxPacketSize (EvaluateContext) failed for slot {}: {:?}",
                    slot,
                    event.completion_code
                );
                fail_enumeration(cont_host, port, slot, false);
                return;
            }
            cont();
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post EvaluateContext for slot {}: {:?}", slot, err);
        fail_enumeration(host, port, slot, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_device_descriptor_request_targets_device_descriptor_index_zero() {
        assert_eq!(GET_DEVICE_DESCRIPTOR_8[1], 0x06); // GET_DESCRIPTOR
        assert_eq!(GET_DEVICE_DESCRIPTOR_8[3], 0x01); // descriptor type = Device
        assert_eq!(u16::from_le_bytes([GET_DEVICE_DESCRIPTOR_8[6], GET_DEVICE_DESCRIPTOR_8[7]]), 8);
    }
}
