//! The [`XhciError`] taxonomy.
//!
//! These map fairly directly onto zx_status_t-style opaque codes in the source driver this core
//! is modeled on: callers are expected to match on a small closed set, not on driver-specific
//! detail.

/// Errors a [`crate::UsbXhci`] can report back to a request completion callback or to the
/// caller of a synchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XhciError {
    /// The controller is halted, the slot is disconnected, or the request was issued during
    /// teardown.
    IoNotPresent,
    /// The endpoint is stalled.
    IoRefused,
    /// The device returned an unexpected completion code for a non-short, non-success transfer.
    IoInvalid,
    /// A generic transfer or command failure.
    Io,
    /// Caller supplied an out-of-range slot, endpoint, or port, or a length validation failed.
    InvalidArgs,
    /// Allocation failed, or a DMA address exceeded 32 bits on a 32-bit-capable controller.
    NoMemory,
    /// A fatal invariant violation. Escalates to controller shutdown; never recovered.
    BadState,
    /// Delivered by [`crate::UsbXhci::cancel_all`].
    Canceled,
    /// An operation this core declines to perform (e.g. resetting a hub's own device).
    NotSupported,
}

impl core::fmt::Display for XhciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            XhciError::IoNotPresent => "device or controller not present",
            XhciError::IoRefused => "endpoint stalled",
            XhciError::IoInvalid => "unexpected completion code",
            XhciError::Io => "transfer or command failed",
            XhciError::InvalidArgs => "invalid arguments",
            XhciError::NoMemory => "out of memory",
            XhciError::BadState => "fatal invariant violation",
            XhciError::Canceled => "canceled",
            XhciError::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

pub type Result<T> = core::result::Result<T, XhciError>;
