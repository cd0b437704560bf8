//! [`EventRing`]: the controller's producer side, software's consumer side of the event
//! protocol. One of these is owned by each [`Interrupter`](crate::interrupter::Interrupter) (this
//! core only ever starts interrupter 0).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::dma::alloc_checked;
use crate::error::Result;
use crate::hal::{DmaBuffer, DmaBufferFactory};
use crate::registers::interrupter::{EventRingDequeuePointer, InterrupterRegisterSet};
use crate::trb::event::{CommandCompletionTrb, CompletionCode, EventTrb, PortStatusChangeTrb, TransferEventTrb};
use crate::trb::RawTrb;

use super::erst::EventRingSegmentTable;

/// Where dispatched events go. Implemented by the controller core (which owns the device/port
/// tables and the command ring this interrupter's events complete TRBs on); kept as a trait here
/// so the ring mechanics in this module stay free of that state.
pub trait EventSink {
    fn on_port_status_change(&self, event: PortStatusChangeTrb);
    fn on_command_completion(&self, event: CommandCompletionTrb);
    fn on_transfer_event(&self, event: TransferEventTrb);
    fn on_host_controller_event(&self, completion_code: CompletionCode);
    /// Software-tracked `MFINDEX` wrap counter bump; the accompanying scheduling use is left to
    /// whoever reads it (see the open question on MFINDEX serialization in the design notes).
    fn on_mfindex_wrap(&self);
}

/// A list of physically-contiguous, page-sized segments the controller writes events into, with
/// a Consumer Cycle State read/write side mirroring the controller's own producer state.
pub struct EventRing {
    segments: Vec<Box<dyn DmaBuffer>>,
    trbs_per_segment: usize,
    erst: EventRingSegmentTable,
    interrupter: InterrupterRegisterSet,
    dequeue_segment: usize,
    dequeue_index: usize,
    ccs: bool,
    page_size: usize,
    is_32bit: bool,
    has_coherent_cache: bool,
}

impl EventRing {
    /// Allocates the (empty) ERST. No event-ring segment exists yet — call
    /// [`add_segment_if_none`](Self::add_segment_if_none) before starting the interrupter.
    pub fn init(
        page_size: usize,
        erst_max_log2: u8,
        is_32bit: bool,
        has_coherent_cache: bool,
        interrupter: InterrupterRegisterSet,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        let erst = EventRingSegmentTable::init(page_size, erst_max_log2, is_32bit, factory)?;
        Ok(Self {
            segments: Vec::new(),
            trbs_per_segment: page_size / RawTrb::LEN,
            erst,
            interrupter,
            dequeue_segment: 0,
            dequeue_index: 0,
            ccs: true,
            page_size,
            is_32bit,
            has_coherent_cache,
        })
    }

    /// Allocates and registers one segment if the ring doesn't have one yet. A no-op on a ring
    /// that has already grown past bring-up.
    pub fn add_segment_if_none(&mut self, factory: &dyn DmaBufferFactory) -> Result<()> {
        if !self.segments.is_empty() {
            return Ok(());
        }
        self.add_segment(factory)
    }

    fn add_segment(&mut self, factory: &dyn DmaBufferFactory) -> Result<()> {
        let buf = alloc_checked(factory, self.page_size, self.is_32bit)?;
        self.erst
            .add_segment(buf.phys_addr(), self.trbs_per_segment as u16, &self.interrupter)?;
        self.segments.push(buf);
        Ok(())
    }

    pub fn erst_base_address(&self) -> u64 {
        self.erst.base_address()
    }

    fn current_phys(&self) -> u64 {
        self.segments[self.dequeue_segment].phys_addr() + (self.dequeue_index * RawTrb::LEN) as u64
    }

    fn current_virt(&self) -> *const RawTrb {
        // SAFETY: `dequeue_index` is always within `trbs_per_segment`.
        unsafe { self.segments[self.dequeue_segment].virt_ptr().add(self.dequeue_index * RawTrb::LEN).cast() }
    }

    pub fn erdp_phys(&self) -> u64 {
        self.current_phys()
    }

    /// The full ERDP register value to program at bring-up or after draining: dequeue pointer,
    /// segment index, and Event Handler Busy cleared.
    pub fn dequeue_pointer_register(&self) -> EventRingDequeuePointer {
        EventRingDequeuePointer::new()
            .with_dequeue_pointer(self.current_phys())
            .with_dequeue_erst_segment_index(self.dequeue_segment as u8)
            .with_event_handler_busy(false)
    }

    /// Reads the event at the dequeue pointer without advancing, returning `None` if its Cycle
    /// doesn't match CCS (nothing new to consume).
    fn peek(&self) -> Option<RawTrb> {
        if self.segments.is_empty() {
            return None;
        }
        if !self.has_coherent_cache {
            self.segments[self.dequeue_segment].invalidate(self.dequeue_index * RawTrb::LEN, RawTrb::LEN);
        }
        // SAFETY: `current_virt` always points at a live segment slot.
        let trb = unsafe { RawTrb::read_volatile(self.current_virt()) };
        if trb.cycle() == self.ccs {
            Some(trb)
        } else {
            None
        }
    }

    /// Advances past the just-peeked TRB, crossing into the next segment (and flipping CCS when
    /// the last segment wraps back to the first) as needed.
    fn advance(&mut self) {
        self.dequeue_index += 1;
        if self.dequeue_index == self.trbs_per_segment {
            self.dequeue_index = 0;
            self.dequeue_segment += 1;
            if self.dequeue_segment == self.segments.len() {
                self.dequeue_segment = 0;
                self.ccs = !self.ccs;
            }
        }
    }

    /// The core interrupt-handler loop (§4.3): drains every event currently visible, dispatching
    /// each to `sink`, then publishes the new dequeue pointer. In non-coherent-cache mode, loops
    /// again immediately if the invalidate-and-recheck turns up more events rather than yielding
    /// back to the caller, trading a busier IRQ thread for lower latency on platforms where a
    /// snoop is not guaranteed to have landed yet.
    pub fn handle_irq(&mut self, sink: &dyn EventSink) {
        loop {
            let mut advanced = false;
            while let Some(trb) = self.peek() {
                match EventTrb::from_raw(trb) {
                    EventTrb::PortStatusChange(event) => sink.on_port_status_change(event),
                    EventTrb::CommandCompletion(event) => sink.on_command_completion(event),
                    EventTrb::Transfer(event) => sink.on_transfer_event(event),
                    EventTrb::MfIndexWrap(_) => sink.on_mfindex_wrap(),
                    EventTrb::HostController { completion_code } => {
                        sink.on_host_controller_event(completion_code)
                    }
                    EventTrb::BandwidthRequest { .. }
                    | EventTrb::Doorbell
                    | EventTrb::DeviceNotification { .. }
                    | EventTrb::Unknown(_) => {
                        // Not generated by anything this core drives; ignored rather than
                        // escalated, per the "unknown TRB type" note applying to the command
                        // ring, not the event ring.
                    }
                }
                self.advance();
                advanced = true;
            }

            if advanced {
                self.interrupter.set_event_ring_dequeue_pointer(self.dequeue_pointer_register());
            }

            if self.has_coherent_cache || self.peek().is_none() {
                break;
            }
        }
    }
}
