//! Input and Output Device Context layout: the Slot Context, the 31 possible Endpoint Contexts,
//! and the Input Control Context that wraps them for `AddressDevice`/`ConfigureEndpoint`/
//! `EvaluateContext`. See xHCI §6.2.

pub mod device_context;
pub mod endpoint_context;
pub mod input_context;
pub mod slot_context;

/// Whether the controller's context data structures are 32 or 64 bytes wide. Fixed at
/// bring-up from `HCCPARAMS1.CSZ` and threaded through every context accessor afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSize {
    /// 32-byte contexts (`CSZ` = 0).
    Small,
    /// 64-byte contexts (`CSZ` = 1).
    Large,
}

impl ContextSize {
    pub(crate) const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Small,
            1 => Self::Large,
            _ => unreachable!(),
        }
    }

    pub(crate) const fn into_bits(self) -> u32 {
        match self {
            Self::Small => 0,
            Self::Large => 1,
        }
    }

    /// The stride, in bytes, between consecutive context entries in a Device Context or Input
    /// Context.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Small => 32,
            Self::Large => 64,
        }
    }
}
