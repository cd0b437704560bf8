//! [`PortState`]: per-root-hub-port bookkeeping. One per `1..=MaxPorts`.

use alloc::boxed::Box;

use spin::Mutex;

struct Inner {
    is_usb3: bool,
    is_connected: bool,
    link_active: bool,
    /// Set while a manual reset/retry is driving this port, so a status-change interrupt that
    /// arrives mid-retry is queued instead of racing a second enumeration attempt.
    retry: bool,
    /// `0` means unbound. Set by `EnableSlot`'s caller once a slot is assigned to this port,
    /// cleared once `DisableSlot` completes.
    slot_id: u8,
    /// A single waiter for the next status-change event on this port (the reset-recovery retry
    /// path uses this to resume once `PRC` is observed rather than polling `PORTSC`).
    pending_wait: Option<Box<dyn FnOnce() + Send>>,
}

/// Per-port state; `1 <= port <= MAX_PORTS`. All mutation goes through `&self` methods backed by
/// an internal lock — ports are touched from the interrupter thread (status-change events) and
/// from enumeration continuations running on the same executor, never concurrently from a caller
/// thread.
pub struct PortState {
    inner: Mutex<Inner>,
}

impl Default for PortState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                is_usb3: false,
                is_connected: false,
                link_active: false,
                retry: false,
                slot_id: 0,
                pending_wait: None,
            }),
        }
    }
}

impl PortState {
    pub fn is_usb3(&self) -> bool {
        self.inner.lock().is_usb3
    }

    pub fn set_usb3(&self, value: bool) {
        self.inner.lock().is_usb3 = value;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().is_connected
    }

    pub fn set_connected(&self, value: bool) {
        self.inner.lock().is_connected = value;
    }

    pub fn link_active(&self) -> bool {
        self.inner.lock().link_active
    }

    pub fn set_link_active(&self, value: bool) {
        self.inner.lock().link_active = value;
    }

    pub fn is_retrying(&self) -> bool {
        self.inner.lock().retry
    }

    pub fn set_retrying(&self, value: bool) {
        self.inner.lock().retry = value;
    }

    pub fn slot_id(&self) -> u8 {
        self.inner.lock().slot_id
    }

    pub fn set_slot_id(&self, slot_id: u8) {
        self.inner.lock().slot_id = slot_id;
    }

    pub fn is_bound(&self) -> bool {
        self.slot_id() != 0
    }

    /// Clears every connection-derived flag on disconnect, leaving `slot_id` alone (the caller
    /// tears the slot down separately, since it may be behind a hub and need hub-aware handling).
    pub fn clear_connection_flags(&self) {
        let mut inner = self.inner.lock();
        inner.is_connected = false;
        inner.is_usb3 = false;
        inner.link_active = false;
        inner.retry = false;
    }

    /// Registers a one-shot waiter for the next status-change event on this port, replacing any
    /// previous one (a port can only be in one manual wait at a time).
    pub fn set_pending_wait(&self, waiter: Box<dyn FnOnce() + Send>) {
        self.inner.lock().pending_wait = Some(waiter);
    }

    /// Fires and clears the pending waiter, if any. Called whenever a status-change event is
    /// processed for this port, whether or not anything is actually waiting.
    pub fn fire_pending_wait(&self) {
        let waiter = self.inner.lock().pending_wait.take();
        if let Some(waiter) = waiter {
            waiter();
        }
    }
}
