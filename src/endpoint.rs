//! Enabling, disabling, resetting, and canceling I/O on a single non-control endpoint.
//!
//! [`enable_endpoint`]/[`disable_endpoint`]/[`reset_endpoint`]/[`cancel_all`] are synchronous
//! entry points a binding calls directly; each posts a short command chain and blocks the caller
//! on it via [`crate::blocking::Blocking`]. [`recover_stall`] drives the same
//! ResetEndpoint/SetTRDequeuePointer chain as `reset_endpoint`, but fire-and-forget: it runs from
//! the interrupter's own event dispatch after a Transfer Event leaves an endpoint `Halted`, and
//! must never block that thread waiting on a command completion that thread itself would have to
//! service.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::blocking::Blocking;
use crate::contexts::device_context::endpoint_dci;
use crate::contexts::endpoint_context::{EndpointContext, EndpointType, EndpointTypeBase};
use crate::contexts::input_context::{InputControlContext, ADD_A0_SLOT};
use crate::enumerator::EnumerationHost;
use crate::error::{Result, XhciError};
use crate::hal::{SuperSpeedEndpointCompanionDescriptor, UsbEndpointDescriptor, UsbSpeed};
use crate::rings::{Completion, TransferRing};
use crate::trb::command::CommandTrb;
use crate::trb::event::CompletionCode;

/// `bEndpointAddress` -> Endpoint Context Index (xHCI §4.5.1: `2 * endpoint_number +
/// direction_in`). Rejects endpoint 0, which is never reached through this module.
fn dci_from_address(ep_address: u8) -> Result<u8> {
    let endpoint_number = ep_address & 0x0f;
    if endpoint_number == 0 {
        return Err(XhciError::InvalidArgs);
    }
    let direction_in = ep_address & 0x80 != 0;
    Ok(endpoint_dci(endpoint_number, direction_in))
}

/// xHCI §6.2.3.6's `Interval` field, which is always expressed in microframes (2^Interval), from
/// a descriptor's `bInterval`, which is expressed in frames below High speed and already a
/// microframe exponent at High speed and above.
fn compute_interval(speed: UsbSpeed, type_base: EndpointTypeBase, b_interval: u8) -> u8 {
    match speed {
        UsbSpeed::Low | UsbSpeed::Full => match type_base {
            EndpointTypeBase::Isoch => {
                let frames = u32::from(b_interval.max(1));
                (31 - frames.leading_zeros() + 3) as u8
            }
            _ => {
                let microframes = u32::from(b_interval.max(1)) * 8;
                (31 - microframes.leading_zeros()) as u8
            }
        },
        _ => b_interval.saturating_sub(1).min(15),
    }
}

/// `(max_burst_size, max_esit_payload)` per xHCI §6.2.3.8: burst and payload-per-service-interval
/// come from the SuperSpeed Companion Descriptor above High speed, from `wMaxPacketSize` bits
/// 12:11 for High-speed periodic endpoints, and are both fixed at the plain packet size otherwise.
fn burst_and_payload(
    speed: UsbSpeed,
    type_base: EndpointTypeBase,
    descriptor: &UsbEndpointDescriptor,
    ss_companion: Option<SuperSpeedEndpointCompanionDescriptor>,
    max_packet_size: u16,
) -> (u8, u32, u8) {
    let is_periodic = matches!(type_base, EndpointTypeBase::Isoch | EndpointTypeBase::Interrupt);
    if speed.is_superspeed() {
        let comp = ss_companion.unwrap_or_default();
        let mult = if type_base == EndpointTypeBase::Isoch {
            comp.attributes & 0x3
        } else {
            0
        };
        let payload =
            u32::from(max_packet_size) * (u32::from(comp.max_burst) + 1) * (u32::from(mult) + 1);
        (comp.max_burst, payload, mult)
    } else if speed == UsbSpeed::High && is_periodic {
        let burst = ((descriptor.max_packet_size >> 11) & 0x3) as u8;
        let payload = u32::from(max_packet_size) * (u32::from(burst) + 1);
        (burst, payload, 0)
    } else {
        (0, u32::from(max_packet_size), 0)
    }
}

fn endpoint_context_for(
    speed: UsbSpeed,
    type_base: EndpointTypeBase,
    direction_in: bool,
    descriptor: UsbEndpointDescriptor,
    ss_companion: Option<SuperSpeedEndpointCompanionDescriptor>,
    tr_dequeue_pointer: u64,
    dequeue_cycle_state: bool,
) -> EndpointContext {
    let max_packet_size = descriptor.max_packet_size & 0x7ff;
    let (max_burst_size, max_esit_payload, mult) =
        burst_and_payload(speed, type_base, &descriptor, ss_companion, max_packet_size);
    let interval = compute_interval(speed, type_base, descriptor.interval);

    EndpointContext::new()
        .with_endpoint_type(EndpointType::for_direction(type_base, direction_in))
        .with_max_packet_size(max_packet_size)
        .with_max_burst_size(max_burst_size)
        .with_mult(mult)
        .with_interval(interval)
        .with_error_count(3)
        .with_average_trb_length(max_packet_size.max(1))
        .with_tr_dequeue_pointer(tr_dequeue_pointer, dequeue_cycle_state)
        .with_max_esit_payload(max_esit_payload)
}

/// Posts `trb` on the command ring and blocks the caller until its completion arrives.
fn post_command_blocking(host: &dyn EnumerationHost, trb: CommandTrb) -> Result<CompletionCode> {
    let blocking = Arc::new(Blocking::new());
    let waiter = blocking.clone();
    let factory = host.factory();
    host.command_ring().post(
        factory,
        host.doorbells(),
        trb,
        Box::new(move |event| waiter.signal(event.completion_code)),
    )?;
    Ok(blocking.wait())
}

/// Allocates a transfer ring for `descriptor`'s endpoint, installs it, and adds the endpoint to
/// `slot_id`'s configuration via `ConfigureEndpoint`. Bumps the Slot Context's `Context Entries`
/// first if this is the highest-indexed endpoint configured so far (xHCI §4.6.6). Rolls the
/// installed ring back out on command failure; there is nothing else to undo; `Context Entries`
/// only ever takes effect on the device's *output* Slot Context, which the command never touched.
pub fn enable_endpoint(
    host: Arc<dyn EnumerationHost>,
    slot_id: u8,
    speed: UsbSpeed,
    descriptor: UsbEndpointDescriptor,
    ss_companion: Option<SuperSpeedEndpointCompanionDescriptor>,
) -> Result<()> {
    let dci = dci_from_address(descriptor.address)?;
    let direction_in = descriptor.address & 0x80 != 0;
    let type_base = match descriptor.attributes & 0b11 {
        1 => EndpointTypeBase::Isoch,
        2 => EndpointTypeBase::Bulk,
        3 => EndpointTypeBase::Interrupt,
        _ => return Err(XhciError::InvalidArgs),
    };

    let device = host.device_state(slot_id);
    let ring = TransferRing::init(
        host.page_size(),
        host.is_32bit(),
        host.has_coherent_cache(),
        host.factory(),
    )?;
    let (tr_dequeue_pointer, dequeue_cycle_state) = ring.enqueue_pointer();
    device.install_ring(dci, ring);

    let input_ctx_ptr = match device.begin_input(|input| {
        let mut flags = InputControlContext::new().with_add_endpoint(dci);
        let slot_ctx = input.slot_context();
        if dci > slot_ctx.context_entries() {
            input.set_slot_context(slot_ctx.with_context_entries(dci));
            flags = flags.with_add_context_flags(flags.add_context_flags() | ADD_A0_SLOT);
        }
        input.set_control_context(flags);
        input.set_endpoint_context(
            dci,
            endpoint_context_for(
                speed,
                type_base,
                direction_in,
                descriptor,
                ss_companion,
                tr_dequeue_pointer,
                dequeue_cycle_state,
            ),
        );
    }) {
        Ok(ptr) => ptr,
        Err(err) => {
            device.take_ring(dci);
            return Err(err);
        }
    };

    let completion_code = match post_command_blocking(
        host.as_ref(),
        CommandTrb::ConfigureEndpoint { slot_id, input_ctx_ptr },
    ) {
        Ok(code) => code,
        Err(err) => {
            device.take_ring(dci);
            return Err(err);
        }
    };
    if completion_code != CompletionCode::Success {
        log::error!(
            "ConfigureEndpoint(enable) failed for slot {} ep {}: {:?}",
            slot_id,
            dci,
            completion_code
        );
        device.take_ring(dci);
        return Err(XhciError::Io);
    }
    Ok(())
}

/// Drops `ep_address`'s endpoint from `slot_id`'s configuration via `ConfigureEndpoint` and tears
/// down its transfer ring once the controller confirms it.
pub fn disable_endpoint(host: Arc<dyn EnumerationHost>, slot_id: u8, ep_address: u8) -> Result<()> {
    let dci = dci_from_address(ep_address)?;
    let device = host.device_state(slot_id);
    if !device.has_ring(dci) {
        return Err(XhciError::InvalidArgs);
    }

    let input_ctx_ptr = device.begin_input(|input| {
        input.set_control_context(
            InputControlContext::new()
                .with_drop_endpoint(dci)
                .with_add_context_flags(ADD_A0_SLOT),
        );
    })?;

    let completion_code = post_command_blocking(
        host.as_ref(),
        CommandTrb::ConfigureEndpoint { slot_id, input_ctx_ptr },
    )?;
    if completion_code != CompletionCode::Success {
        log::error!(
            "ConfigureEndpoint(disable) failed for slot {} ep {}: {:?}",
            slot_id,
            dci,
            completion_code
        );
        return Err(XhciError::Io);
    }
    device.take_ring(dci);
    Ok(())
}

type Cont = Box<dyn FnOnce(Result<()>) + Send>;

fn fire_once(cont: &Arc<Mutex<Option<Cont>>>, result: Result<()>) {
    if let Some(c) = cont.lock().take() {
        c(result);
    }
}

/// `ResetEndpoint` followed by `SetTRDequeuePointer` at the ring's own current enqueue position,
/// clearing `stalled` once both land. Shared by [`reset_endpoint`] (which blocks a caller on it)
/// and [`recover_stall`] (which does not); `cont` is the only difference between the two.
fn recover_stall_chain(host: Arc<dyn EnumerationHost>, slot_id: u8, dci: u8, cont: Cont) {
    let cont = Arc::new(Mutex::new(Some(cont)));
    let reset_host = host.clone();
    let reset_cont = cont.clone();
    let factory = host.factory();
    let result = host.command_ring().post(
        factory,
        host.doorbells(),
        CommandTrb::ResetEndpoint {
            slot_id,
            endpoint_id: dci,
            transfer_state_preserve: false,
        },
        Box::new(move |event| {
            if event.completion_code != CompletionCode::Success {
                log::error!(
                    "ResetEndpoint failed for slot {} ep {}: {:?}",
                    slot_id,
                    dci,
                    event.completion_code
                );
                fire_once(&reset_cont, Err(XhciError::Io));
                return;
            }

            let Some((dequeue_ptr, dequeue_cycle_state)) = reset_host
                .device_state(slot_id)
                .with_ring(dci, |ring| ring.enqueue_pointer())
            else {
                fire_once(&reset_cont, Err(XhciError::InvalidArgs));
                return;
            };

            let set_host = reset_host.clone();
            let set_cont = reset_cont.clone();
            let factory = reset_host.factory();
            let set_result = reset_host.command_ring().post(
                factory,
                reset_host.doorbells(),
                CommandTrb::SetTrDequeuePointer {
                    slot_id,
                    endpoint_id: dci,
                    dequeue_ptr,
                    dequeue_cycle_state,
                },
                Box::new(move |event| {
                    if event.completion_code != CompletionCode::Success {
                        log::error!(
                            "SetTRDequeuePointer failed for slot {} ep {}: {:?}",
                            slot_id,
                            dci,
                            event.completion_code
                        );
                        fire_once(&set_cont, Err(XhciError::Io));
                        return;
                    }
                    set_host
                        .device_state(slot_id)
                        .with_ring(dci, |ring| ring.set_stalled(false));
                    fire_once(&set_cont, Ok(()));
                }),
            );
            if let Err(err) = set_result {
                log::error!(
                    "failed to post SetTRDequeuePointer for slot {} ep {}: {:?}",
                    slot_id,
                    dci,
                    err
                );
                fire_once(&reset_cont, Err(err));
            }
        }),
    );
    if let Err(err) = result {
        log::error!(
            "failed to post ResetEndpoint for slot {} ep {}: {:?}",
            slot_id,
            dci,
            err
        );
        fire_once(&cont, Err(err));
    }
}

/// Recovers a `Halted` endpoint so queuing can resume. Returns `BadState` immediately if the
/// ring isn't actually marked stalled — this is a caller-facing API, not the IRQ-path recovery
/// hook (see [`recover_stall`]), so an unnecessary call is a caller bug worth surfacing rather
/// than a harmless no-op.
pub fn reset_endpoint(host: Arc<dyn EnumerationHost>, slot_id: u8, ep_address: u8) -> Result<()> {
    let dci = dci_from_address(ep_address)?;
    let stalled = host
        .device_state(slot_id)
        .with_ring(dci, |ring| ring.is_stalled())
        .ok_or(XhciError::InvalidArgs)?;
    if !stalled {
        return Err(XhciError::BadState);
    }

    let blocking = Arc::new(Blocking::new());
    let waiter = blocking.clone();
    recover_stall_chain(host, slot_id, dci, Box::new(move |result| waiter.signal(result)));
    blocking.wait()
}

/// Fire-and-forget counterpart of [`reset_endpoint`], called from the interrupter's own Transfer
/// Event dispatch when a completion leaves an endpoint `Halted`. Must never be waited on from
/// that same thread — there would be nothing left to drain the event ring and deliver the
/// completions this chain depends on.
pub fn recover_stall(host: Arc<dyn EnumerationHost>, slot_id: u8, dci: u8) {
    recover_stall_chain(
        host,
        slot_id,
        dci,
        Box::new(move |result| {
            if let Err(err) = result {
                log::error!(
                    "automatic stall recovery failed for slot {} ep {}: {:?}",
                    slot_id,
                    dci,
                    err
                );
            }
        }),
    );
}

/// Stops `ep_address`'s endpoint, fails every TD still queued on it with [`XhciError::Canceled`],
/// and moves the ring's dequeue pointer past them so a future transfer doesn't replay them.
pub fn cancel_all(host: Arc<dyn EnumerationHost>, slot_id: u8, ep_address: u8) -> Result<()> {
    let dci = dci_from_address(ep_address)?;
    let device = host.device_state(slot_id);
    if !device.has_ring(dci) {
        return Err(XhciError::InvalidArgs);
    }

    let completion_code = post_command_blocking(
        host.as_ref(),
        CommandTrb::StopEndpoint { slot_id, endpoint_id: dci },
    )?;
    if completion_code != CompletionCode::Success {
        log::error!(
            "StopEndpoint failed for slot {} ep {}: {:?}",
            slot_id,
            dci,
            completion_code
        );
        return Err(XhciError::Io);
    }

    let drained = device
        .with_ring(dci, |ring| {
            let drained = ring.take_pending_trbs();
            ring.flip_cycle_bits(&drained);
            drained
        })
        .unwrap_or_default();
    let had_pending = !drained.is_empty();
    for ctx in drained {
        if let Completion::Request(request) = ctx.completion {
            (request.complete)(Err(XhciError::Canceled), 0);
        }
    }
    if !had_pending {
        return Ok(());
    }

    let Some((dequeue_ptr, dequeue_cycle_state)) =
        device.with_ring(dci, |ring| ring.enqueue_pointer())
    else {
        return Err(XhciError::InvalidArgs);
    };
    let completion_code = post_command_blocking(
        host.as_ref(),
        CommandTrb::SetTrDequeuePointer {
            slot_id,
            endpoint_id: dci,
            dequeue_ptr,
            dequeue_cycle_state,
        },
    )?;
    if completion_code != CompletionCode::Success {
        log::error!(
            "SetTRDequeuePointer(cancel) failed for slot {} ep {}: {:?}",
            slot_id,
            dci,
            completion_code
        );
        return Err(XhciError::Io);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dci_rejects_endpoint_zero() {
        assert_eq!(dci_from_address(0x80), Err(XhciError::InvalidArgs));
        assert_eq!(dci_from_address(0x00), Err(XhciError::InvalidArgs));
    }

    #[test]
    fn dci_splits_number_and_direction() {
        assert_eq!(dci_from_address(0x01).unwrap(), 2); // EP1 OUT
        assert_eq!(dci_from_address(0x81).unwrap(), 3); // EP1 IN
    }

    #[test]
    fn interval_for_low_speed_interrupt_is_in_microframes() {
        // 1 ms (the fastest a Low/Full speed interrupt endpoint can ask for) is 8 microframes.
        assert_eq!(compute_interval(UsbSpeed::Low, EndpointTypeBase::Interrupt, 1), 3);
    }

    #[test]
    fn interval_for_full_speed_isoch_adds_the_frame_to_microframe_shift() {
        assert_eq!(compute_interval(UsbSpeed::Full, EndpointTypeBase::Isoch, 1), 3);
        assert_eq!(compute_interval(UsbSpeed::Full, EndpointTypeBase::Isoch, 4), 5);
    }

    #[test]
    fn interval_for_high_speed_is_the_encoded_exponent_minus_one() {
        assert_eq!(compute_interval(UsbSpeed::High, EndpointTypeBase::Interrupt, 1), 0);
        assert_eq!(compute_interval(UsbSpeed::High, EndpointTypeBase::Isoch, 4), 3);
    }

    #[test]
    fn burst_and_payload_is_plain_packet_size_below_high_speed() {
        let descriptor = UsbEndpointDescriptor {
            address: 0x81,
            attributes: 3,
            max_packet_size: 64,
            interval: 1,
        };
        assert_eq!(
            burst_and_payload(UsbSpeed::Full, EndpointTypeBase::Interrupt, &descriptor, None, 64),
            (0, 64, 0)
        );
    }

    #[test]
    fn burst_and_payload_folds_high_speed_extra_transactions() {
        let descriptor = UsbEndpointDescriptor {
            address: 0x81,
            attributes: 1,
            max_packet_size: 0x0800 | 256, // bits 12:11 = 1 extra transaction
            interval: 1,
        };
        let (burst, payload, _mult) =
            burst_and_payload(UsbSpeed::High, EndpointTypeBase::Isoch, &descriptor, None, 256);
        assert_eq!(burst, 1);
        assert_eq!(payload, 512);
    }

    #[test]
    fn burst_and_payload_multiplies_mult_for_superspeed_isoch() {
        let descriptor = UsbEndpointDescriptor {
            address: 0x81,
            attributes: 1,
            max_packet_size: 1024,
            interval: 1,
        };
        let comp = SuperSpeedEndpointCompanionDescriptor {
            max_burst: 1,
            attributes: 1,
        };
        let (burst, payload, mult) = burst_and_payload(
            UsbSpeed::Super,
            EndpointTypeBase::Isoch,
            &descriptor,
            Some(comp),
            1024,
        );
        assert_eq!(burst, 1);
        assert_eq!(mult, 1);
        assert_eq!(payload, 1024 * 2 * 2);
    }
}
