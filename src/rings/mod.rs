//! The three ring flavors this core drives: the controller-producer [`EventRing`] (with its
//! [`erst::EventRingSegmentTable`]), and the software-producer [`transfer_ring::TransferRing`]
//! (used both as a per-endpoint Transfer Ring and, with `CommandRing`, as the Command Ring).
//!
//! Every ring here is a growable list of page-sized, physically-contiguous segments linked by
//! Link TRBs rather than one fixed allocation, because neither the number of commands in flight
//! nor the number of outstanding transfer TDs is known up front.

pub mod erst;
pub mod event_ring;
pub mod transfer_ring;
pub mod trb_context;

pub use erst::EventRingSegmentTable;
pub use event_ring::{EventRing, EventSink};
pub use transfer_ring::{CommandRing, ReservedTrb, RingSnapshot, TransferRing};
pub use trb_context::{Completion, RingToken, TrbContext};
