//! Hub topology support: route-string extension for a newly attached child, `ConfigureHub`'s
//! Slot Context stamp (plus `SET_HUB_DEPTH` for SuperSpeed hubs), and hub-aware teardown when a
//! downstream device is reported removed.
//!
//! Builds entirely on [`crate::enumerator::EnumerationHost`] rather than naming
//! [`crate::controller::UsbXhci`] directly — the same seam the enumerator itself is driven
//! through, since every operation here is "enable a slot behind another slot" or "mutate a slot's
//! own Slot Context," both already expressible against that trait.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::contexts::input_context::{InputControlContext, ADD_A0_SLOT};
use crate::control_pipeline;
use crate::device_state::{HubInfo, TtInfo};
use crate::enumerator::{enumerate_device, EnumerationHost, ParentHub};
use crate::error::{Result, XhciError};
use crate::hal::{UsbHubDescriptor, UsbRequest, UsbRequestHeader, UsbSpeed};
use crate::rings::{Completion, TrbContext};
use crate::trb::command::CommandTrb;
use crate::trb::event::CompletionCode;

type Cont = Box<dyn FnOnce(Result<()>) + Send>;

/// Calls the completion exactly once, however it is reached: this module always hands the same
/// [`Cont`] to both a synchronous failure path and an asynchronous command-completion closure, and
/// only one of the two ever runs.
fn fire_once(cont: Arc<Mutex<Option<Cont>>>, result: Result<()>) {
    if let Some(c) = cont.lock().take() {
        c(result);
    }
}

/// Computes the [`HubInfo`] a newly attached child inherits from the hub it just enumerated
/// behind, per xHCI §4.3.3's route string construction: `route_string |= port << (4 *
/// parent_hub_depth)`. `parent_speed` is the parent hub's own negotiated link speed (not the
/// child's), used only to decide whether the parent itself supplies the Transaction Translator.
pub fn hub_info_for_child(
    parent_slot_id: u8,
    parent_hub: &HubInfo,
    parent_speed: UsbSpeed,
    parent_port_number: u8,
    child_speed: UsbSpeed,
) -> HubInfo {
    let route_string = parent_hub.route_string
        | (u32::from(parent_port_number) << (4 * u32::from(parent_hub.hub_depth)));

    // A Low/Full-speed child needs a TT. If the parent is itself a High-speed hub it supplies one
    // directly (one per downstream port if multi-TT, otherwise a single shared TT at port 0);
    // otherwise any TT requirement was already resolved further up the tree and is inherited as-is
    // (a Low/Full-speed hub never has a TT of its own).
    let tt = if !matches!(child_speed, UsbSpeed::Low | UsbSpeed::Full) {
        TtInfo::default()
    } else if parent_speed == UsbSpeed::High {
        TtInfo {
            tt_slot_id: parent_slot_id,
            tt_port_number: if parent_hub.multi_tt { parent_port_number } else { 0 },
        }
    } else {
        parent_hub.tt
    };

    HubInfo {
        is_hub: false,
        multi_tt: false,
        number_of_ports: 0,
        route_string,
        hub_depth: parent_hub.hub_depth + 1,
        root_hub_port_number: parent_hub.root_hub_port_number,
        tt,
    }
}

/// `bRequest` for the USB 3.0 `SET_HUB_DEPTH` class request (USB 3.2 §10.14.2.8), issued only to
/// SuperSpeed hubs so they know how many bits of the route string they own when addressing their
/// own children.
const SET_HUB_DEPTH: u8 = 12;

/// Stamps `SPEED`/`MULTI_TT`/`HUB=1`/`PORT_COUNT`/`TTT` into `slot_id`'s Slot Context via
/// `EvaluateContext`, records the device's own hub characteristics on its [`DeviceState`], and (for
/// SuperSpeed hubs only) follows up with `SET_HUB_DEPTH` on EP0.
///
/// [`DeviceState`]: crate::device_state::DeviceState
pub fn configure_hub(
    host: Arc<dyn EnumerationHost>,
    slot_id: u8,
    speed: UsbSpeed,
    descriptor: UsbHubDescriptor,
    cont: Box<dyn FnOnce(Result<()>) + Send>,
) {
    let cont = Arc::new(Mutex::new(Some(cont)));
    let multi_tt = descriptor.characteristics & 0b11 != 0;
    let think_time = if speed == UsbSpeed::High {
        ((descriptor.characteristics >> 5) & 0x3) as u8
    } else {
        0
    };
    let num_ports = descriptor.num_ports;

    let input_ctx_ptr = host.device_state(slot_id).begin_input(|input| {
        input.set_control_context(InputControlContext::new().with_add_context_flags(ADD_A0_SLOT));
        let slot_ctx = input
            .slot_context()
            .with_speed(speed.to_slot_speed())
            .with_multi_tt(multi_tt)
            .with_is_hub(true)
            .with_number_of_ports(num_ports)
            .with_tt_think_time(think_time);
        input.set_slot_context(slot_ctx);
    });
    let input_ctx_ptr = match input_ctx_ptr {
        Ok(ptr) => ptr,
        Err(err) => {
            fire_once(cont, Err(err));
            return;
        }
    };

    let factory = host.factory();
    let complete_host = host.clone();
    let complete_cont = cont.clone();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::EvaluateContext { slot_id, input_ctx_ptr },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "ConfigureHub EvaluateContext failed for slot {}: {:?}",
                    slot_id,
                    event.completion_code
                );
                fire_once(complete_cont, Err(XhciError::Io));
                return;
            }

            let existing = complete_host.device_state(slot_id).hub().unwrap_or_default();
            let port = complete_host.device_state(slot_id).port();
            let updated = HubInfo {
                is_hub: true,
                multi_tt,
                number_of_ports: num_ports,
                ..existing
            };
            complete_host.device_state(slot_id).set_device_information(slot_id, port, Some(updated));

            if speed.is_superspeed() {
                set_hub_depth(complete_host, slot_id, existing.hub_depth, complete_cont);
            } else {
                fire_once(complete_cont, Ok(()));
            }
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post ConfigureHub EvaluateContext for slot {}: {:?}", slot_id, err);
        fire_once(cont, Err(err));
    }
}

fn set_hub_depth(host: Arc<dyn EnumerationHost>, slot_id: u8, hub_depth: u8, cont: Arc<Mutex<Option<Cont>>>) {
    let setup = [0x20, SET_HUB_DEPTH, hub_depth, 0, 0, 0, 0, 0];
    let complete_cont = cont.clone();
    let request = UsbRequest {
        header: UsbRequestHeader {
            device_id: slot_id - 1,
            ep_address: 0,
            length: 0,
            frame: 0,
        },
        setup: Some(setup),
        chunks: Vec::new(),
        complete: Box::new(move |status, _transferred| {
            fire_once(complete_cont, status);
        }),
    };
    let factory = host.factory();
    let device_state = host.device_state(slot_id);
    if let Err(err) =
        control_pipeline::queue_control_request(device_state, slot_id, factory, host.doorbells(), request)
    {
        log::error!("failed to queue SET_HUB_DEPTH for slot {}: {:?}", slot_id, err);
        fire_once(cont, Err(err));
    }
}

/// Extends the route string for a device that just linked up behind hub `hub_slot_id`'s downstream
/// port `hub_port`, and queues its enumeration. Returns as soon as enumeration has been queued, not
/// once the device is online (enumeration itself is fire-and-forget; see
/// [`crate::enumerator::enumerate_device`]).
pub fn hub_device_added(
    host: Arc<dyn EnumerationHost>,
    hub_slot_id: u8,
    hub_port: u8,
    child_speed: UsbSpeed,
) -> Result<()> {
    let parent_hub = host.device_state(hub_slot_id).hub().ok_or(XhciError::InvalidArgs)?;
    if !parent_hub.is_hub {
        return Err(XhciError::InvalidArgs);
    }
    let parent_slot_ctx = host
        .device_state(hub_slot_id)
        .output_slot_context()
        .ok_or(XhciError::BadState)?;
    let parent_speed = UsbSpeed::from_slot_speed(parent_slot_ctx.speed()).ok_or(XhciError::BadState)?;

    let child_info = hub_info_for_child(hub_slot_id, &parent_hub, parent_speed, hub_port, child_speed);
    let parent = ParentHub {
        slot_id: hub_slot_id,
        port_number: hub_port,
        info: child_info,
        speed: child_speed,
    };
    enumerate_device(host, hub_port, Some(parent));
    Ok(())
}

fn complete_with(ctx: TrbContext, err: XhciError) {
    if let Completion::Request(request) = ctx.completion {
        (request.complete)(Err(err), 0);
    }
}

/// A device behind hub `hub_slot_id`'s downstream port `hub_port` was reported removed: drains
/// whatever I/O was still outstanding on it, tells the bus client, and disables its slot.
pub fn hub_device_removed(
    host: Arc<dyn EnumerationHost>,
    hub_slot_id: u8,
    hub_port: u8,
    cont: Box<dyn FnOnce(Result<()>) + Send>,
) {
    let cont = Arc::new(Mutex::new(Some(cont)));
    let Some(slot_id) = host.device_state(hub_slot_id).take_hub_child(hub_port) else {
        fire_once(cont, Err(XhciError::InvalidArgs));
        return;
    };

    let device = host.device_state(slot_id);
    device.set_disconnecting(true);
    for ctx in device.take_all_pending() {
        complete_with(ctx, XhciError::IoNotPresent);
    }
    host.bus_client().remove_device(slot_id - 1);

    let factory = host.factory();
    let teardown_host = host.clone();
    let complete_cont = cont.clone();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::DisableSlot { slot_id },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "HubDeviceRemoved DisableSlot({}) failed: {:?}",
                    slot_id,
                    event.completion_code
                );
                fire_once(complete_cont, Err(XhciError::Io));
                return;
            }
            teardown_host.dcbaa().set_output_context(slot_id, 0);
            teardown_host.device_state(slot_id).reset();
            fire_once(complete_cont, Ok(()));
        }),
    );
    if let Err(err) = result {
        log::error!("failed to post HubDeviceRemoved DisableSlot({}): {:?}", slot_id, err);
        fire_once(cont, Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(route_string: u32, hub_depth: u8, multi_tt: bool) -> HubInfo {
        HubInfo {
            is_hub: true,
            multi_tt,
            number_of_ports: 4,
            route_string,
            hub_depth,
            root_hub_port_number: 3,
            tt: TtInfo::default(),
        }
    }

    #[test]
    fn route_string_folds_in_child_port_at_parent_depth() {
        let parent = hub(0x5, 1, false);
        let child = hub_info_for_child(7, &parent, UsbSpeed::High, 2, UsbSpeed::High);
        assert_eq!(child.route_string, 0x5 | (2 << 4));
        assert_eq!(child.hub_depth, 2);
        assert_eq!(child.root_hub_port_number, 3);
    }

    #[test]
    fn high_speed_child_has_no_tt() {
        let parent = hub(0, 0, true);
        let child = hub_info_for_child(1, &parent, UsbSpeed::High, 3, UsbSpeed::High);
        assert_eq!(child.tt.tt_slot_id, 0);
    }

    #[test]
    fn full_speed_child_of_multi_tt_hub_gets_its_own_port_tt() {
        let parent = hub(0, 0, true);
        let child = hub_info_for_child(9, &parent, UsbSpeed::High, 5, UsbSpeed::Full);
        assert_eq!(child.tt.tt_slot_id, 9);
        assert_eq!(child.tt.tt_port_number, 5);
    }

    #[test]
    fn full_speed_child_of_single_tt_hub_shares_port_zero() {
        let parent = hub(0, 0, false);
        let child = hub_info_for_child(9, &parent, UsbSpeed::High, 5, UsbSpeed::Low);
        assert_eq!(child.tt.tt_slot_id, 9);
        assert_eq!(child.tt.tt_port_number, 0);
    }

    #[test]
    fn full_speed_child_behind_a_nested_full_speed_hub_inherits_parent_tt() {
        let mut parent = hub(0, 1, true);
        parent.tt = TtInfo { tt_slot_id: 4, tt_port_number: 2 };
        let child = hub_info_for_child(12, &parent, UsbSpeed::Full, 1, UsbSpeed::Low);
        assert_eq!(child.tt.tt_slot_id, 4);
        assert_eq!(child.tt.tt_port_number, 2);
    }
}
