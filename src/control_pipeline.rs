//! Builds and completes the four-phase (Setup/Data/Status) control transfer that every request
//! to endpoint 0 turns into. One [`queue_control_request`] call stamps a whole TD atomically;
//! [`handle_transfer_event`] is the other half, invoked from the slot's Transfer Event dispatch.

use alloc::boxed::Box;

use crate::contexts::device_context::EP0_DCI;
use crate::device_state::DeviceState;
use crate::error::{Result, XhciError};
use crate::hal::{DmaBufferFactory, UsbRequest};
use crate::registers::doorbell::{DoorbellRegisters, DoorbellTarget};
use crate::rings::{Completion, TrbContext, TransferRing};
use crate::trb::event::{CompletionCode, TransferEventTrb};
use crate::trb::transfer::TransferTrb;

/// A request with no `setup` packet was routed here by mistake.
fn require_setup(request: &UsbRequest) -> Result<[u8; 8]> {
    request.setup.ok_or(XhciError::InvalidArgs)
}

/// The Status Stage runs opposite the Data Stage's direction; a no-data request's status stage
/// is always IN (USB 2.0 §9.4).
fn status_stage_direction_in(has_data: bool, data_direction_in: bool) -> bool {
    if has_data {
        !data_direction_in
    } else {
        true
    }
}

/// Queues one control transfer on `device`'s EP0 ring. `request.setup` is required; at most one
/// data chunk is supported (control transfers this core originates are all short reads/writes —
/// `GET_DESCRIPTOR`, `SET_HUB_DEPTH`, and friends — never multi-chunk scatter-gather).
pub fn queue_control_request(
    device: &DeviceState,
    slot_id: u8,
    factory: &dyn DmaBufferFactory,
    doorbells: &DoorbellRegisters,
    request: UsbRequest,
) -> Result<()> {
    if device.is_disconnecting() {
        (request.complete)(Err(XhciError::IoNotPresent), 0);
        return Err(XhciError::IoNotPresent);
    }
    let setup = match require_setup(&request) {
        Ok(setup) => setup,
        Err(err) => {
            (request.complete)(Err(err), 0);
            return Err(err);
        }
    };
    if request.chunks.len() > 1 {
        (request.complete)(Err(XhciError::InvalidArgs), 0);
        return Err(XhciError::InvalidArgs);
    }
    if !device.has_ring(EP0_DCI) {
        (request.complete)(Err(XhciError::IoNotPresent), 0);
        return Err(XhciError::IoNotPresent);
    }
    let direction_in = request.header.ep_address & 0x80 != 0;
    let has_data = request.chunks.first().is_some() && request.header.length > 0;

    let outcome = device.with_control_ring(|ring| -> Result<()> {
        if ring.is_stalled() {
            (request.complete)(Err(XhciError::IoRefused), 0);
            return Err(XhciError::IoRefused);
        }

        let snapshot = ring.save_state();
        let trb_count = 2 + usize::from(has_data);
        let reserved = match ring.reserve_contiguous(trb_count, factory) {
            Ok(reserved) => reserved,
            Err(err) => {
                ring.rollback(snapshot);
                (request.complete)(Err(err), 0);
                return Err(err);
            }
        };

        let mut slots = reserved.iter();
        let setup_slot = *slots.next().expect("reserved trb_count TRBs");
        let data_slot = if has_data { slots.next().copied() } else { None };
        let status_slot = *slots.next().expect("reserved trb_count TRBs");

        if let (Some(slot), Some(chunk)) = (data_slot, request.chunks.first()) {
            let data_trb = TransferTrb::DataStage {
                data_buffer: chunk.phys_addr,
                trb_transfer_length: request.header.length,
                td_size: 0,
                interrupter_target: 0,
                direction_in,
                chain: true,
                isp: true,
            };
            ring.write_reserved(slot, data_trb.to_raw(slot.cycle));
        }

        let status_trb = TransferTrb::StatusStage {
            direction_in: status_stage_direction_in(has_data, direction_in),
            interrupt_on_completion: true,
        };
        ring.write_reserved(status_slot, status_trb.to_raw(status_slot.cycle));

        // Setup Stage is written, and its Cycle bit committed, last: the controller must never
        // observe a partially-stamped TD.
        let setup_trb = TransferTrb::SetupStage {
            setup_packet: setup,
            data_stage_direction_in: if has_data { Some(direction_in) } else { None },
        };
        ring.write_reserved(setup_slot, setup_trb.to_raw(setup_slot.cycle));

        ring.commit_transaction(snapshot);
        ring.assign_context(TrbContext::for_request(
            ring.token(),
            status_slot.phys_addr,
            setup_slot.phys_addr,
            trb_count as u32,
            request,
        ));
        ring.ring_doorbell(doorbells, Some(slot_id), DoorbellTarget::ControlEndpoint);
        Ok(())
    });

    outcome.unwrap_or(Err(XhciError::IoNotPresent))
}

/// `bRequest` for `GET_DESCRIPTOR`, and the descriptor type byte of a `DEVICE_QUALIFIER` request
/// (USB 2.0 §9.4.3), used to recognize the probe some hubs stall instead of answering.
const GET_DESCRIPTOR: u8 = 0x06;
const DEVICE_QUALIFIER_DESCRIPTOR_TYPE: u8 = 0x06;

/// Some hubs answer `GET_DESCRIPTOR(DEVICE_QUALIFIER)` with a STALL instead of the
/// not-a-high-speed-capable-device qualifier descriptor USB 2.0 actually calls for. Recognizing
/// the exact probe lets EP0 recover without treating the rest of the device as broken.
fn is_defective_hub_device_qualifier_probe(request: &UsbRequest) -> bool {
    request.header.ep_address == 0
        && request.setup.is_some_and(|setup| {
            setup[0] == 0x80
                && setup[1] == GET_DESCRIPTOR
                && setup[2] == 0
                && setup[3] == DEVICE_QUALIFIER_DESCRIPTOR_TYPE
                && setup[4] == 0
                && setup[5] == 0
        })
}

fn transferred_len(ctx: &TrbContext, request: &UsbRequest) -> usize {
    if ctx.short_length > 0 {
        (ctx.transfer_len_including_short_trb - ctx.short_length) as usize
    } else {
        request.header.length as usize
    }
}

/// Resolves `device`'s EP0 ring against a Transfer Event, completing the queued [`UsbRequest`]
/// this control transfer belongs to (if the TD has fully finished) or recording a short-packet
/// byte count (if not). Returns `Ok(true)` when EP0 is left `Halted` on the controller and the
/// caller must recover it with `ResetEndpoint` + `SetTRDequeuePointer` before queuing anything
/// else.
pub fn handle_transfer_event(device: &DeviceState, event: TransferEventTrb) -> Result<bool> {
    device
        .with_control_ring(|ring| complete(ring, event))
        .unwrap_or(Err(XhciError::IoNotPresent))
}

fn complete(ring: &TransferRing, event: TransferEventTrb) -> Result<bool> {
    if event.completion_code == CompletionCode::ShortPacket {
        let first_trb =
            ring.handle_short_packet(event.trb_pointer, event.transfer_length_remaining)?;
        if first_trb != event.trb_pointer {
            // Multi-TRB TD: the final TRB's own event still completes it.
            return Ok(false);
        }
        // Single-TRB TD: this ShortPacket event is the only event the TD will ever generate.
    }

    let ctx = ring.complete_trb(event.trb_pointer)?;
    let Completion::Request(request) = ctx.completion else {
        return Err(XhciError::BadState);
    };

    if event.completion_code != CompletionCode::StallError {
        let transferred = transferred_len(&ctx, &request);
        let status = match event.completion_code {
            CompletionCode::Success | CompletionCode::ShortPacket => Ok(()),
            other => {
                log::warn!("control transfer on slot ring failed: {:?}", other);
                Err(XhciError::IoInvalid)
            }
        };
        (request.complete)(status, transferred);
        return Ok(false);
    }

    ring.set_stalled(true);

    if ring.pending_count() == 0 && is_defective_hub_device_qualifier_probe(&request) {
        // The hub stalled instead of answering; act as if it had reported a zero-length
        // qualifier descriptor rather than surfacing the stall to callers.
        (request.complete)(Ok(()), request.header.length as usize);
        return Ok(true);
    }

    let transferred = transferred_len(&ctx, &request);
    (request.complete)(Err(XhciError::IoRefused), transferred);
    for drained in ring.take_pending_trbs() {
        if let Completion::Request(pending) = drained.completion {
            (pending.complete)(Err(XhciError::IoRefused), 0);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_direction_is_opposite_data_direction() {
        assert!(!status_stage_direction_in(true, true));
        assert!(status_stage_direction_in(true, false));
    }

    #[test]
    fn status_direction_is_in_for_no_data_requests() {
        assert!(status_stage_direction_in(false, false));
        assert!(status_stage_direction_in(false, true));
    }
}
