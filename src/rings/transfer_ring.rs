//! [`TransferRing`]: a growable, segmented software-producer ring. Used directly as a
//! per-endpoint Transfer Ring, and wrapped by [`CommandRing`] for the one Command Ring an
//! interrupter-0-only core needs.
//!
//! Segments are page-sized and linked by a [`LinkTrb`] in the last slot of every segment. The
//! ring never shrinks: when the enqueue pointer is about to reach the segment that currently
//! closes the loop back to segment 0, [`TransferRing::reserve`] splices in a fresh segment
//! instead, so an in-flight TD already sitting near the front of the ring is never overwritten.
//! This trades memory for the complexity of tracking the controller's own dequeue position,
//! which this core does not otherwise need to know.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::dma::alloc_checked;
use crate::error::{Result, XhciError};
use crate::hal::{DmaBuffer, DmaBufferFactory};
use crate::registers::doorbell::{DoorbellRegisters, DoorbellTarget};
use crate::trb::event::CommandCompletionTrb;
use crate::trb::link::{LinkTrb, LinkTrbControl};
use crate::trb::RawTrb;

use super::trb_context::{RingToken, TrbContext};

/// Enqueue-pointer coordinates captured by [`TransferRing::save_state`], restored by
/// [`TransferRing::rollback`] if a multi-TRB transaction fails partway through construction.
#[derive(Debug, Clone, Copy)]
pub struct RingSnapshot {
    segment: usize,
    index: usize,
    pcs: bool,
}

/// A reserved (but not yet written) ring slot: its physical address, and the Cycle value the
/// caller must stamp into it, recorded at the moment the slot was reserved rather than when it
/// is finally written (a reservation can outlive a segment crossing that flips the ring's PCS).
#[derive(Debug, Clone, Copy)]
pub struct ReservedTrb {
    pub phys_addr: u64,
    pub cycle: bool,
}

struct Inner {
    segments: Vec<Box<dyn DmaBuffer>>,
    /// TRB slots per segment, including the trailing Link TRB.
    trbs_per_segment: usize,
    enqueue_segment: usize,
    enqueue_index: usize,
    /// Producer Cycle State.
    pcs: bool,
    pending: VecDeque<TrbContext>,
    token: RingToken,
    /// Sticky: set once a `StopEndpoint`/error leaves the ring in a state a caller must recover
    /// from with `SetTrDequeuePointer` before reuse.
    stalled: bool,
}

impl Inner {
    fn usable_slots(&self) -> usize {
        self.trbs_per_segment - 1
    }

    fn link_offset(&self) -> usize {
        self.usable_slots() * RawTrb::LEN
    }

    fn current_virt(&self) -> *mut u8 {
        let seg = &self.segments[self.enqueue_segment];
        // SAFETY: `enqueue_index` is always within `usable_slots()`.
        unsafe { seg.virt_ptr().add(self.enqueue_index * RawTrb::LEN) }
    }

    fn current_phys(&self) -> u64 {
        self.segments[self.enqueue_segment].phys_addr() + (self.enqueue_index * RawTrb::LEN) as u64
    }

    /// Advances the enqueue pointer by one slot, crossing into the next segment (and flipping
    /// `pcs` if that segment's Link TRB has Toggle Cycle set) when the segment is exhausted.
    fn advance(&mut self) {
        self.enqueue_index += 1;
        if self.enqueue_index == self.usable_slots() {
            let link_offset = self.link_offset();
            let link_raw = unsafe {
                RawTrb::read_volatile(
                    self.segments[self.enqueue_segment]
                        .virt_ptr()
                        .add(link_offset)
                        .cast(),
                )
            };
            let control = LinkTrbControl::from(link_raw.control);
            let target = self
                .segments
                .iter()
                .position(|s| s.phys_addr() == link_raw.pointer)
                .expect("ring Link TRB must always point at a known segment");
            self.enqueue_segment = target;
            self.enqueue_index = 0;
            if control.toggle_cycle() {
                self.pcs = !self.pcs;
            }
        }
    }

    /// Splices a freshly allocated segment between the current segment and whatever its Link TRB
    /// currently points to, taking over as the (possibly ring-closing) terminator.
    fn grow(&mut self, factory: &dyn DmaBufferFactory, is_32bit: bool, page_size: usize) -> Result<()> {
        let new_buf = alloc_checked(factory, page_size, is_32bit)?;
        let link_offset = self.link_offset();
        let cur = self.enqueue_segment;

        let cur_link_raw = unsafe {
            RawTrb::read_volatile(self.segments[cur].virt_ptr().add(link_offset).cast())
        };
        let cur_control = LinkTrbControl::from(cur_link_raw.control);

        let new_link = LinkTrb::new(cur_link_raw.pointer, cur_control.toggle_cycle(), false).to_raw(self.pcs);
        unsafe {
            RawTrb::write_volatile(new_buf.virt_ptr().add(link_offset).cast(), new_link);
        }
        new_buf.flush(link_offset, RawTrb::LEN);

        let rewritten = LinkTrb::new(new_buf.phys_addr(), false, false).to_raw(cur_link_raw.cycle());
        unsafe {
            RawTrb::write_volatile(self.segments[cur].virt_ptr().add(link_offset).cast(), rewritten);
        }
        self.segments[cur].flush(link_offset, RawTrb::LEN);

        self.segments.push(new_buf);
        Ok(())
    }

    /// Ensures at least two writable slots remain in the current segment before the enqueue
    /// pointer would need to cross its Link TRB, growing the ring if not.
    fn reserve_room(&mut self, factory: &dyn DmaBufferFactory, is_32bit: bool, page_size: usize) -> Result<()> {
        if self.usable_slots() - self.enqueue_index < 2 {
            self.grow(factory, is_32bit, page_size)?;
        }
        Ok(())
    }

    fn phys_to_virt(&self, phys: u64) -> Option<*mut RawTrb> {
        for seg in &self.segments {
            let base = seg.phys_addr();
            let len = seg.len() as u64;
            if phys >= base && phys < base + len {
                let offset = (phys - base) as usize;
                return Some(unsafe { seg.virt_ptr().add(offset).cast() });
            }
        }
        None
    }
}

/// A software-producer ring: a per-endpoint Transfer Ring, or (wrapped by [`CommandRing`]) the
/// Command Ring. Internally single-lock-guarded: `TransferRing.mutex` in the data model this
/// implements, separate from whatever per-slot lock a [`crate::device_state::DeviceState`] holds
/// around a whole transaction.
pub struct TransferRing {
    inner: Mutex<Inner>,
    page_size: usize,
    is_32bit: bool,
    has_coherent_cache: bool,
}

impl TransferRing {
    /// Allocates the first segment and wires its Link TRB to close the ring back on itself
    /// (Toggle Cycle set), the steady state every ring starts and usually stays in.
    pub fn init(
        page_size: usize,
        is_32bit: bool,
        has_coherent_cache: bool,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        let buf = alloc_checked(factory, page_size, is_32bit)?;
        let trbs_per_segment = page_size / RawTrb::LEN;
        let link_offset = (trbs_per_segment - 1) * RawTrb::LEN;
        let link = LinkTrb::new(buf.phys_addr(), true, false).to_raw(true);
        unsafe {
            RawTrb::write_volatile(buf.virt_ptr().add(link_offset).cast(), link);
        }
        buf.flush(link_offset, RawTrb::LEN);

        Ok(Self {
            inner: Mutex::new(Inner {
                segments: alloc::vec![buf],
                trbs_per_segment,
                enqueue_segment: 0,
                enqueue_index: 0,
                pcs: true,
                pending: VecDeque::new(),
                token: 1,
                stalled: false,
            }),
            page_size,
            is_32bit,
            has_coherent_cache,
        })
    }

    /// Tears down and reallocates the ring, discarding any contexts still pending (their waiters
    /// are dropped, never invoked: callers that need cancellation notifications must drain
    /// [`take_pending_trbs`](Self::take_pending_trbs) first). Bumps the token so stale contexts
    /// sitting in caller-held state elsewhere can recognize this ring has moved on.
    pub fn reinit(&self, factory: &dyn DmaBufferFactory) -> Result<()> {
        let fresh = Self::init(self.page_size, self.is_32bit, self.has_coherent_cache, factory)?;
        let mut inner = self.inner.lock();
        let mut fresh_inner = fresh.inner.into_inner();
        fresh_inner.token = inner.token.wrapping_add(1);
        *inner = fresh_inner;
        Ok(())
    }

    pub fn token(&self) -> RingToken {
        self.inner.lock().token
    }

    pub fn is_stalled(&self) -> bool {
        self.inner.lock().stalled
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().stalled = stalled;
    }

    /// Physical address and Cycle state of the next slot that would be written, for programming
    /// into a `SetTrDequeuePointer` command after recovering a stopped/errored ring.
    pub fn enqueue_pointer(&self) -> (u64, bool) {
        let inner = self.inner.lock();
        (inner.current_phys(), inner.pcs)
    }

    pub fn save_state(&self) -> RingSnapshot {
        let inner = self.inner.lock();
        RingSnapshot {
            segment: inner.enqueue_segment,
            index: inner.enqueue_index,
            pcs: inner.pcs,
        }
    }

    /// Restores the enqueue pointer to a prior snapshot. Segments allocated by growth since the
    /// snapshot was taken are left in place (the ring never shrinks) but simply unused.
    pub fn rollback(&self, snapshot: RingSnapshot) {
        let mut inner = self.inner.lock();
        inner.enqueue_segment = snapshot.segment;
        inner.enqueue_index = snapshot.index;
        inner.pcs = snapshot.pcs;
    }

    /// Flushes every segment touched between `since` and the current enqueue pointer. A no-op on
    /// a cache-coherent platform.
    pub fn commit_transaction(&self, since: RingSnapshot) {
        if self.has_coherent_cache {
            return;
        }
        let inner = self.inner.lock();
        let mut seg = since.segment;
        loop {
            inner.segments[seg].flush(0, inner.segments[seg].len());
            if seg == inner.enqueue_segment {
                break;
            }
            seg = (seg + 1) % inner.segments.len();
        }
    }

    /// Reserves one slot without writing to it, growing the ring first if needed. The caller
    /// writes the TRB itself (with [`write_reserved`](Self::write_reserved)) once its final
    /// content — including, for the first TRB of a TD, the Cycle bit — is known.
    pub fn reserve(&self, factory: &dyn DmaBufferFactory) -> Result<ReservedTrb> {
        let mut inner = self.inner.lock();
        inner.reserve_room(factory, self.is_32bit, self.page_size)?;
        let reserved = ReservedTrb {
            phys_addr: inner.current_phys(),
            cycle: inner.pcs,
        };
        inner.advance();
        Ok(reserved)
    }

    /// Reserves `n` contiguous slots within a single segment, padding the current segment with
    /// Nop TRBs first if it cannot fit the whole run. Used by isochronous TDs whose TRBs must not
    /// be separated by a Link TRB.
    pub fn reserve_contiguous(&self, n: usize, factory: &dyn DmaBufferFactory) -> Result<Vec<ReservedTrb>> {
        let mut inner = self.inner.lock();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > inner.usable_slots() {
            return Err(XhciError::InvalidArgs);
        }
        if inner.usable_slots() - inner.enqueue_index < n {
            // Pad out the rest of this segment, then ensure the next one exists.
            while inner.enqueue_index < inner.usable_slots() {
                let cycle = inner.pcs;
                let virt = inner.current_virt().cast();
                unsafe {
                    RawTrb::write_volatile(
                        virt,
                        crate::trb::transfer::TransferTrb::NoOp {
                            chain: false,
                            interrupt_on_completion: false,
                        }
                        .to_raw(cycle),
                    );
                }
                inner.advance();
            }
            inner.reserve_room(factory, self.is_32bit, self.page_size)?;
            if inner.usable_slots() - inner.enqueue_index < n {
                return Err(XhciError::NoMemory);
            }
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(ReservedTrb {
                phys_addr: inner.current_phys(),
                cycle: inner.pcs,
            });
            inner.advance();
        }
        Ok(out)
    }

    /// Writes a fully-formed TRB (cycle already stamped via
    /// [`TransferTrb::to_raw`](crate::trb::transfer::TransferTrb::to_raw) with the `cycle` from
    /// the matching [`ReservedTrb`]) into a previously reserved slot.
    pub fn write_reserved(&self, reserved: ReservedTrb, raw: RawTrb) {
        let inner = self.inner.lock();
        let ptr = inner
            .phys_to_virt(reserved.phys_addr)
            .expect("reserved address must belong to this ring");
        unsafe {
            RawTrb::write_volatile(ptr, raw);
        }
        if !self.has_coherent_cache {
            // SAFETY: `ptr` came from one of our own segments.
            let seg = inner
                .segments
                .iter()
                .find(|s| {
                    let base = s.phys_addr();
                    reserved.phys_addr >= base && reserved.phys_addr < base + s.len() as u64
                })
                .expect("segment containing reserved slot must exist");
            seg.flush((reserved.phys_addr - seg.phys_addr()) as usize, RawTrb::LEN);
        }
    }

    /// Attaches bookkeeping to the TD that ends at `last_trb_phys`, to be delivered to its
    /// completion's waiter once a Transfer/Command Completion Event names that TRB.
    pub fn assign_context(&self, context: TrbContext) {
        self.inner.lock().pending.push_back(context);
    }

    /// Rings the command ring doorbell after one or more commands have been written and their
    /// contexts assigned — a convenience wrapper most callers use instead of driving the
    /// doorbell registers directly.
    pub fn ring_doorbell(&self, doorbells: &DoorbellRegisters, slot_id: Option<u8>, target: DoorbellTarget) {
        match slot_id {
            Some(slot) => doorbells.ring_endpoint(slot, target),
            None => doorbells.ring_command_ring(),
        }
    }

    /// Pops the context matching `trb_phys` (the front of the pending FIFO, since TDs complete in
    /// order). Returns `Err(BadState)` if the front context doesn't match — a ring bug or an
    /// event for a TRB this ring never enqueued.
    pub fn complete_trb(&self, trb_phys: u64) -> Result<TrbContext> {
        let mut inner = self.inner.lock();
        match inner.pending.front() {
            Some(ctx) if ctx.trb_ptr == trb_phys => Ok(inner.pending.pop_front().unwrap()),
            _ => Err(XhciError::BadState),
        }
    }

    /// Accumulates a short-packet report against the pending context this `short_trb_phys`
    /// belongs to (it may be any TRB in a multi-TRB TD, not necessarily the last), without
    /// popping it — the TD's own completion event, for its final TRB, is what actually resolves
    /// the waiter. Walks the TD's TRBs (which `reserve_contiguous` guarantees sit at consecutive
    /// physical addresses) from `first_trb` up to and including `short_trb_phys`, summing their
    /// `TRB Transfer Length` fields into the context's `transfer_len_including_short_trb`, then
    /// adds `short_length` to the context's tally and returns the context's `first_trb` for
    /// diagnostic logging.
    pub fn handle_short_packet(&self, short_trb_phys: u64, short_length: u32) -> Result<u64> {
        let mut inner = self.inner.lock();
        let (first_trb, span) = {
            let ctx = inner
                .pending
                .front()
                .filter(|ctx| ctx.trb_ptr == short_trb_phys || ctx.first_trb <= short_trb_phys)
                .ok_or(XhciError::BadState)?;
            (ctx.first_trb, ctx.span)
        };

        let mut transferred = 0u32;
        let mut found = false;
        for i in 0..span {
            let phys = first_trb + (i as u64) * RawTrb::LEN as u64;
            let ptr = inner.phys_to_virt(phys).ok_or(XhciError::BadState)?;
            // SAFETY: `phys` is a slot within this ring, written by the TD's own construction.
            let raw = unsafe { RawTrb::read_volatile(ptr) };
            transferred += crate::trb::transfer::trb_transfer_length(&raw);
            if phys == short_trb_phys {
                found = true;
                break;
            }
        }
        if !found {
            return Err(XhciError::BadState);
        }

        let ctx = inner.pending.front_mut().expect("checked above");
        ctx.transfer_len_including_short_trb = transferred;
        ctx.short_length += short_length;
        Ok(ctx.first_trb)
    }

    /// Drains every pending context (in FIFO order), for a `CancelAll`/endpoint-reset/unbind
    /// drain. The caller is responsible for completing each with `Canceled`.
    pub fn take_pending_trbs(&self) -> VecDeque<TrbContext> {
        core::mem::take(&mut self.inner.lock().pending)
    }

    /// Flips the Cycle bit of every physical TRB slot spanned by `contexts`, so the controller
    /// won't re-run them if the ring's dequeue pointer is later moved back over this stretch by
    /// `SetTrDequeuePointer`. Intended for TDs just drained by `take_pending_trbs`/
    /// `take_pending_trbs_until` as part of a cancel.
    pub fn flip_cycle_bits(&self, contexts: &VecDeque<TrbContext>) {
        let inner = self.inner.lock();
        for ctx in contexts {
            for i in 0..ctx.span {
                let phys = ctx.first_trb + (i as u64) * RawTrb::LEN as u64;
                let Some(ptr) = inner.phys_to_virt(phys) else {
                    continue;
                };
                // SAFETY: `phys` is a slot within this ring, written by the TD's own construction.
                let mut raw = unsafe { RawTrb::read_volatile(ptr) };
                raw.control ^= 1;
                unsafe {
                    RawTrb::write_volatile(ptr, raw);
                }
                if !self.has_coherent_cache {
                    if let Some(seg) = inner
                        .segments
                        .iter()
                        .find(|s| phys >= s.phys_addr() && phys < s.phys_addr() + s.len() as u64)
                    {
                        seg.flush((phys - seg.phys_addr()) as usize, RawTrb::LEN);
                    }
                }
            }
        }
    }

    /// Drains pending contexts up to and including the one ending at `end_phys` (used when a
    /// `StopEndpoint` or ring-stopped event reports how far the controller actually got).
    pub fn take_pending_trbs_until(&self, end_phys: u64) -> VecDeque<TrbContext> {
        let mut inner = self.inner.lock();
        let mut drained = VecDeque::new();
        while let Some(ctx) = inner.pending.pop_front() {
            let done = ctx.trb_ptr == end_phys;
            drained.push_back(ctx);
            if done {
                break;
            }
        }
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// The Command Ring: a [`TransferRing`] used only by interrupter 0, restricted to
/// [`CommandTrb`](crate::trb::command::CommandTrb)s. Kept as a distinct type (rather than a type
/// alias) so command-specific helpers — posting a keep-alive Nop, the single well-known doorbell
/// target — have a home that can't be confused with a per-endpoint ring.
pub struct CommandRing {
    ring: TransferRing,
}

impl CommandRing {
    pub fn init(
        page_size: usize,
        is_32bit: bool,
        has_coherent_cache: bool,
        factory: &dyn DmaBufferFactory,
    ) -> Result<Self> {
        Ok(Self {
            ring: TransferRing::init(page_size, is_32bit, has_coherent_cache, factory)?,
        })
    }

    pub fn ring(&self) -> &TransferRing {
        &self.ring
    }

    /// `CRCR.command_ring_pointer`/`ring_cycle_state` to program at controller bring-up.
    pub fn initial_crcr_fields(&self) -> (u64, bool) {
        self.ring.enqueue_pointer()
    }

    /// Posts one command TRB, attaches its completion waiter, and rings the Command Ring
    /// doorbell, returning the command's physical address (mostly useful for
    /// logging/abort-matching).
    pub fn post(
        &self,
        factory: &dyn DmaBufferFactory,
        doorbells: &DoorbellRegisters,
        trb: crate::trb::command::CommandTrb,
        waiter: Box<dyn FnOnce(CommandCompletionTrb) + Send>,
    ) -> Result<u64> {
        let reserved = self.ring.reserve(factory)?;
        self.ring.write_reserved(reserved, trb.to_raw(reserved.cycle));
        self.ring
            .assign_context(TrbContext::for_command(self.ring.token(), reserved.phys_addr, waiter));
        self.ring.ring_doorbell(doorbells, None, DoorbellTarget::CommandRing);
        Ok(reserved.phys_addr)
    }

    /// Posts a keep-alive Nop command — used by a quirk workaround for controllers whose Command
    /// Ring goes idle and stops accepting doorbells after a period of inactivity.
    pub fn post_noop(&self, factory: &dyn DmaBufferFactory, doorbells: &DoorbellRegisters) -> Result<u64> {
        let reserved = self.ring.reserve(factory)?;
        self.ring
            .write_reserved(reserved, crate::trb::command::CommandTrb::NoOp.to_raw(reserved.cycle));
        self.ring.ring_doorbell(doorbells, None, DoorbellTarget::CommandRing);
        Ok(reserved.phys_addr)
    }
}
