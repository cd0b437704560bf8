//! [`Interrupter`]: one interrupter's event ring, registers, and cooperative executor, bound
//! together as the unit whose IRQ thread is expected to call [`Interrupter::service`] in a loop.
//!
//! This core only ever starts interrupter 0 (see the Open Question on dynamic interrupter
//! assignment in the design notes); nothing here prevents a binding from constructing more, but
//! [`crate::controller::UsbXhci`] never does.

use alloc::sync::Arc;
use alloc::boxed::Box;

use spin::Mutex;

use crate::error::Result;
use crate::hal::{DmaBufferFactory, Timer};
use crate::registers::interrupter::{InterrupterManagement, InterrupterModeration, InterrupterRegisterSet};
use crate::registers::runtime::RuntimeRegisters;
use crate::rings::{EventRing, EventSink};

use crate::executor::Executor;

/// One interrupter: its event ring, the `IMAN`/`IMOD` register handle used to arm/ack it, and a
/// private task queue for continuations that run on this interrupter's thread (command
/// completions, timers, the enumeration state machine).
pub struct Interrupter {
    event_ring: Mutex<EventRing>,
    management: InterrupterRegisterSet,
    executor: Executor,
    timer: Arc<dyn Timer>,
}

impl Interrupter {
    /// Allocates the ERST and the first event-ring segment, then arms `IMAN.interrupt_enable`.
    /// The caller still needs to enable interrupts controller-wide (`USBCMD.interrupter_enable`)
    /// separately.
    pub fn init(
        page_size: usize,
        erst_max_log2: u8,
        is_32bit: bool,
        has_coherent_cache: bool,
        runtime: &RuntimeRegisters,
        index: u16,
        timer: Arc<dyn Timer>,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        let mut event_ring = EventRing::init(
            page_size,
            erst_max_log2,
            is_32bit,
            has_coherent_cache,
            runtime.interrupter(index),
            factory,
        )?;
        event_ring.add_segment_if_none(factory)?;

        let management = runtime.interrupter(index);
        management.set_event_ring_segment_table_base_address(event_ring.erst_base_address());
        management.set_event_ring_dequeue_pointer(event_ring.dequeue_pointer_register());
        management.set_management(InterrupterManagement::new().with_interrupt_enable(true));

        Ok(Self {
            event_ring: Mutex::new(event_ring),
            management,
            executor: Executor::new(),
            timer,
        })
    }

    /// Drains the event ring, dispatching every event to `sink`, runs any executor continuations
    /// that are now ready, and acknowledges `IMAN.interrupt_pending`. Called once per interrupt
    /// firing from the interrupter's dedicated thread.
    pub fn service(&self, sink: &dyn EventSink) {
        self.event_ring.lock().handle_irq(sink);
        self.executor.run_until_idle(self.timer.now_nanos());
        self.management
            .set_management(InterrupterManagement::new().with_interrupt_enable(true).with_interrupt_pending(true));
    }

    /// Runs executor continuations whose timer deadline has passed, without touching the event
    /// ring. Useful for a binding whose IRQ wait has a bounded timeout and wants cooperative
    /// timers serviced even with no controller traffic (see [`Timer`]'s doc comment).
    pub fn poll_timers(&self) {
        self.executor.run_until_idle(self.timer.now_nanos());
    }

    pub fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        self.executor.schedule(task);
    }

    pub fn schedule_after_nanos(&self, delay_ns: u64, task: Box<dyn FnOnce() + Send>) {
        let deadline = self.timer.now_nanos().saturating_add(delay_ns);
        self.executor.schedule_after(deadline, task);
    }

    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.executor.next_timer_deadline()
    }

    /// `CRCR`-independent bring-up accessor: lets [`crate::controller::UsbXhci`] confirm the ERST
    /// was actually programmed, for logging during `Init`.
    pub fn erst_base_address(&self) -> u64 {
        self.event_ring.lock().erst_base_address()
    }

    /// Sets `IMOD`'s interval, in 250ns units. Called once during `Init` to coalesce the event
    /// interrupt rate instead of taking one IRQ per event.
    pub fn set_moderation_interval(&self, interval: u16) {
        self.management
            .set_moderation(InterrupterModeration::new().with_interval(interval));
    }
}
