//! [`TrbContext`]: the per-TRB bookkeeping a ring attaches to a TD so its completion can be
//! routed back to whoever is waiting on it.

use alloc::boxed::Box;

use crate::hal::UsbRequest;
use crate::trb::event::CommandCompletionTrb;

/// Tags the ring generation a context was allocated under. A context whose token does not match
/// the ring's current token is stale (the ring was reinitialized out from under it); rings bump
/// their token on every `init`/`deinit` so leftover contexts from before a reset are discarded
/// rather than delivered to the wrong waiter.
pub type RingToken = u64;

/// What happens when the TRB(s) this context is attached to complete.
pub enum Completion {
    /// A command-ring waiter: called once with the `CommandCompletionEvent` that named this
    /// command's TRB.
    Command(Box<dyn FnOnce(CommandCompletionTrb) + Send>),
    /// A queued USB request: completed with a status and the number of bytes actually
    /// transferred, per [`UsbRequest::complete`](crate::hal::UsbRequest).
    Request(UsbRequest),
}

/// Bookkeeping attached to the last TRB of a TD (or, for a command, the command TRB itself).
pub struct TrbContext {
    pub token: RingToken,
    /// Physical address of the TRB this context completes through.
    pub trb_ptr: u64,
    /// Physical address of the first TRB of the TD, used to attribute a short-packet event (on
    /// some other TRB further down the ring) back to this context.
    pub first_trb: u64,
    /// Bytes the device did not send, accumulated from a `ShortPacket` event seen before this
    /// context's own completion.
    pub short_length: u32,
    /// Total bytes spanned by the TD through (and including) the TRB that reported short,
    /// accumulated by [`TransferRing::handle_short_packet`](super::transfer_ring::TransferRing::handle_short_packet).
    pub transfer_len_including_short_trb: u32,
    /// Number of physical TRB slots this TD occupies, from `first_trb` to `trb_ptr` inclusive
    /// (Link/Nop padding TRBs not included). Lets the ring reclaim exactly as much space as a
    /// completing or cancelled TD actually used.
    pub span: u32,
    pub completion: Completion,
}

impl TrbContext {
    pub fn for_command(token: RingToken, trb_ptr: u64, waiter: Box<dyn FnOnce(CommandCompletionTrb) + Send>) -> Self {
        Self {
            token,
            trb_ptr,
            first_trb: trb_ptr,
            short_length: 0,
            transfer_len_including_short_trb: 0,
            span: 1,
            completion: Completion::Command(waiter),
        }
    }

    pub fn for_request(token: RingToken, trb_ptr: u64, first_trb: u64, span: u32, request: UsbRequest) -> Self {
        Self {
            token,
            trb_ptr,
            first_trb,
            short_length: 0,
            transfer_len_including_short_trb: 0,
            span,
            completion: Completion::Request(request),
        }
    }
}
