//! A one-shot spin-wait primitive that lets a synchronous entry point block the calling thread
//! on an asynchronous command-ring completion running on the interrupter thread.
//!
//! Grounded on the source driver's `sync_completion_t` + `RunSynchronously(...Async(...))`
//! pattern (usb-xhci.cc): every synchronous `UsbHci*` call (`EnableEndpoint`, `ResetEndpoint`,
//! `CancelAll`, `ConfigureHub`, `HubDeviceAdded`) posts the same async continuation chain the
//! core otherwise drives fire-and-forget, then blocks the caller until the chain's last
//! continuation signals completion. This core has no portable blocking channel to build that on
//! (see [`crate::hal::Timer`]'s doc comment: a binding's IRQ wait runs on its own thread, never
//! the caller's), so it spins instead. Callers must never call `wait` from the interrupter
//! thread itself — there would be nothing left to advance the event ring and unblock it; see
//! [`crate::endpoint::recover_stall`], which shares the same continuation chain as
//! [`crate::endpoint::reset_endpoint`] but never blocks for exactly this reason.

use core::hint;

use spin::Mutex;

/// Fired exactly once, from whatever continuation is the last link in an async chain; waited on
/// exactly once, from the thread that started the chain.
pub struct Blocking<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Blocking<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Delivers the result. Only the first call has any effect; a waiter only ever calls this
    /// once it is through using the chain, so a second call would be a bug in the caller, not
    /// something this type needs to guard more strongly than silently ignoring.
    pub fn signal(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    /// Spins until [`signal`](Self::signal) has been called, then returns the value.
    pub fn wait(&self) -> T {
        loop {
            if let Some(value) = self.slot.lock().take() {
                return value;
            }
            hint::spin_loop();
        }
    }
}

impl<T> Default for Blocking<T> {
    fn default() -> Self {
        Self::new()
    }
}
