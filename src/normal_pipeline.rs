//! Queues Bulk, Interrupt, and Isochronous transfers onto a non-control endpoint's transfer
//! ring, and completes them back out of Transfer Events. Control transfers go through
//! [`crate::control_pipeline`] instead; this module never touches EP0.

use alloc::vec::Vec;

use crate::contexts::endpoint_context::EndpointType;
use crate::device_state::DeviceState;
use crate::error::{Result, XhciError};
use crate::hal::{DmaBufferFactory, Timer, UsbRequest};
use crate::registers::doorbell::{DoorbellRegisters, DoorbellTarget};
use crate::rings::{Completion, TrbContext, TransferRing};
use crate::trb::event::{CompletionCode, TransferEventTrb};
use crate::trb::transfer::TransferTrb;

/// Microframes (xHCI §4.11.2.5) of lead time an isochronous TD must keep ahead of the current
/// frame for the controller to reliably service it.
const ISOCH_SCHEDULING_THRESHOLD_FRAMES: u32 = 895 / 8;

fn doorbell_target_for_dci(dci: u8) -> DoorbellTarget {
    let endpoint_number = dci / 2;
    if dci % 2 == 1 {
        DoorbellTarget::InEndpoint(endpoint_number)
    } else {
        DoorbellTarget::OutEndpoint(endpoint_number)
    }
}

/// `(burst_count, last_burst_packet_count)`, both floor-zero, per xHCI §4.11.2.3's Isoch TRB
/// `TBC`/`TLBPC` fields.
fn isoch_burst_fields(packet_count: u32, max_burst_size: u8) -> (u32, u32) {
    let burst_size = u32::from(max_burst_size) + 1;
    let burst_count = (packet_count / burst_size).saturating_sub(1);
    let last_burst_packet_count = (packet_count % burst_size).saturating_sub(1);
    (burst_count, last_burst_packet_count)
}

/// Queues `request` on `device`'s ring for endpoint context index `dci` (2..=31; see
/// [`crate::contexts::device_context::endpoint_dci`]). Isochronous requests with a nonzero
/// `header.frame` block the caller until the scheduling window opens.
pub fn queue_transfer(
    device: &DeviceState,
    dci: u8,
    factory: &dyn DmaBufferFactory,
    doorbells: &DoorbellRegisters,
    slot_id: u8,
    timer: &dyn Timer,
    current_frame: u32,
    request: UsbRequest,
) -> Result<()> {
    if device.is_disconnecting() {
        (request.complete)(Err(XhciError::IoNotPresent), 0);
        return Err(XhciError::IoNotPresent);
    }
    let ep_ctx = match device.output_endpoint_context(dci) {
        Some(ep_ctx) => ep_ctx,
        None => {
            (request.complete)(Err(XhciError::InvalidArgs), 0);
            return Err(XhciError::InvalidArgs);
        }
    };
    let is_isoch = matches!(
        ep_ctx.endpoint_type(),
        EndpointType::IsochIn | EndpointType::IsochOut
    );

    if is_isoch && request.header.frame > 0 {
        let earliest = request.header.frame.saturating_sub(ISOCH_SCHEDULING_THRESHOLD_FRAMES);
        if earliest < current_frame {
            (request.complete)(Err(XhciError::Io), 0);
            return Err(XhciError::Io);
        }
        if earliest > current_frame {
            let frames_to_wait = u64::from(earliest - current_frame);
            let deadline = timer.now_nanos().saturating_add(frames_to_wait * 1_000_000);
            timer.sleep_until(deadline);
        }
    }

    let chunk_count = request.chunks.len();
    if chunk_count == 0 {
        (request.complete)(Err(XhciError::InvalidArgs), 0);
        return Err(XhciError::InvalidArgs);
    }
    if !device.has_ring(dci) {
        (request.complete)(Err(XhciError::IoNotPresent), 0);
        return Err(XhciError::IoNotPresent);
    }

    let outcome = device.with_ring(dci, |ring| -> Result<()> {
        if ring.is_stalled() {
            (request.complete)(Err(XhciError::IoRefused), 0);
            return Err(XhciError::IoRefused);
        }

        let snapshot = ring.save_state();
        let reserved = match ring.reserve_contiguous(chunk_count, factory) {
            Ok(reserved) => reserved,
            Err(err) => {
                ring.rollback(snapshot);
                (request.complete)(Err(err), 0);
                return Err(err);
            }
        };

        let (burst_count, last_burst_packet_count) =
            isoch_burst_fields(chunk_count as u32, ep_ctx.max_burst_size());

        for (i, slot) in reserved.iter().enumerate() {
            let chunk = request.chunks[i];
            let chain = i + 1 != chunk_count;
            let interrupt_on_completion = !chain;
            let td_size = (chunk_count - i - 1) as u8;

            let trb = if is_isoch && i == 0 {
                TransferTrb::Isoch {
                    data_buffer: chunk.phys_addr,
                    trb_transfer_length: chunk.len as u32,
                    td_size,
                    interrupter_target: 0,
                    interrupt_on_completion,
                    transfer_burst_count: burst_count as u8,
                    last_burst_packet_count: last_burst_packet_count as u8,
                    start_isoch_asap: request.header.frame == 0,
                    frame_id: (request.header.frame % 2048) as u16,
                }
            } else {
                TransferTrb::Normal {
                    data_buffer: chunk.phys_addr,
                    trb_transfer_length: chunk.len as u32,
                    td_size,
                    interrupter_target: 0,
                    interrupt_on_completion,
                    isp: true,
                    chain,
                    immediate_data: false,
                }
            };
            ring.write_reserved(*slot, trb.to_raw(slot.cycle));
        }

        ring.commit_transaction(snapshot);
        let first = reserved[0];
        let last = reserved[chunk_count - 1];
        ring.assign_context(TrbContext::for_request(
            ring.token(),
            last.phys_addr,
            first.phys_addr,
            chunk_count as u32,
            request,
        ));
        ring.ring_doorbell(doorbells, Some(slot_id), doorbell_target_for_dci(dci));
        Ok(())
    });

    outcome.unwrap_or(Err(XhciError::IoNotPresent))
}

/// Resolves a Transfer Event against endpoint `dci`'s ring. Mirrors
/// [`crate::control_pipeline::handle_transfer_event`], plus the isochronous "missed service"
/// path: a `BadState` from `complete_trb` (event named a TRB that isn't the ring's head) is only
/// benign on an Isoch ring, where the controller skipping TDs it never serviced is routine. On a
/// bulk/interrupt ring the same mismatch is a genuine ring-invariant violation and propagates as
/// `BadState` for the caller to escalate. Returns `Ok(true)` when the endpoint is left `Halted`
/// and the caller must recover it with `ResetEndpoint` + `SetTRDequeuePointer`.
pub fn handle_transfer_event(
    device: &DeviceState,
    dci: u8,
    event: TransferEventTrb,
) -> Result<bool> {
    let is_isoch = device.output_endpoint_context(dci).is_some_and(|ep_ctx| {
        matches!(
            ep_ctx.endpoint_type(),
            EndpointType::IsochIn | EndpointType::IsochOut
        )
    });
    device
        .with_ring(dci, |ring| complete(ring, event, is_isoch))
        .unwrap_or(Err(XhciError::IoNotPresent))
}

fn complete(ring: &TransferRing, event: TransferEventTrb, is_isoch: bool) -> Result<bool> {
    if event.completion_code == CompletionCode::ShortPacket {
        let first_trb =
            ring.handle_short_packet(event.trb_pointer, event.transfer_length_remaining)?;
        if first_trb != event.trb_pointer {
            // Multi-TRB TD: the final TRB's own event still completes it.
            return Ok(false);
        }
        // Single-TRB TD: this ShortPacket event is the only event the TD will ever generate.
    }

    match ring.complete_trb(event.trb_pointer) {
        Ok(ctx) => {
            let stalled = event.completion_code == CompletionCode::StallError;
            if stalled {
                ring.set_stalled(true);
            }
            finish(ctx, event.completion_code);
            Ok(stalled)
        }
        Err(XhciError::BadState) if is_isoch => {
            // Missed-service: the controller completed out past where we thought the head was.
            // Drain everything up to and including the named TRB and fail it all.
            let missed = ring.take_pending_trbs_until(event.trb_pointer);
            for ctx in missed {
                finish(ctx, CompletionCode::Other(0));
            }
            Ok(false)
        }
        Err(other) => Err(other),
    }
}

fn finish(ctx: TrbContext, completion_code: CompletionCode) {
    let Completion::Request(request) = ctx.completion else {
        return;
    };
    let transferred = if ctx.short_length > 0 {
        (ctx.transfer_len_including_short_trb - ctx.short_length) as usize
    } else {
        request.header.length as usize
    };
    let status = match completion_code {
        CompletionCode::Success | CompletionCode::ShortPacket => Ok(()),
        CompletionCode::StallError => Err(XhciError::IoRefused),
        _ => Err(XhciError::IoInvalid),
    };
    (request.complete)(status, transferred);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_fields_floor_zero_on_a_single_packet() {
        assert_eq!(isoch_burst_fields(1, 0), (0, 0));
    }

    #[test]
    fn burst_fields_split_across_full_bursts() {
        // max_burst_size field is "bursts - 1", so 2 means 3 packets per burst; 9 packets is
        // exactly three full bursts, so the remainder (last_burst_packet_count) floors to zero.
        assert_eq!(isoch_burst_fields(9, 2), (2, 0));
    }

    #[test]
    fn burst_fields_with_a_partial_final_burst() {
        assert_eq!(isoch_burst_fields(11, 2), (2, 1));
    }

    #[test]
    fn doorbell_target_splits_dci_into_endpoint_and_direction() {
        assert_eq!(doorbell_target_for_dci(2), DoorbellTarget::OutEndpoint(1));
        assert_eq!(doorbell_target_for_dci(3), DoorbellTarget::InEndpoint(1));
        assert_eq!(doorbell_target_for_dci(4), DoorbellTarget::OutEndpoint(2));
        assert_eq!(doorbell_target_for_dci(5), DoorbellTarget::InEndpoint(2));
    }
}
