//! The [`LinkTrb`] type: the terminator every ring segment ends with.

use bitfield_struct::bitfield;

use super::{RawTrb, TrbType};

/// Flags carried by a Link TRB's `control` word.
#[bitfield(u32)]
pub struct LinkTrbControl {
    pub cycle: bool,
    /// Toggle Cycle: whether the controller/software should flip its Producer/Consumer Cycle
    /// State after processing this TRB. Set on the segment that closes the ring back to its
    /// first segment.
    pub toggle_cycle: bool,

    #[bits(2)]
    __: u8,

    /// Whether the following TRB is part of the same TD as the one before this link.
    pub chain: bool,
    pub interrupt_on_completion: bool,

    #[bits(4)]
    __: u8,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(10)]
    pub interrupter_target: u16,
}

/// A Link TRB: points at the start of another ring segment. See xHCI §6.4.4.1.
#[derive(Debug, Clone, Copy)]
pub struct LinkTrb {
    pub segment_pointer: u64,
    pub toggle_cycle: bool,
    pub chain: bool,
}

impl LinkTrb {
    pub fn new(segment_pointer: u64, toggle_cycle: bool, chain: bool) -> Self {
        Self {
            segment_pointer,
            toggle_cycle,
            chain,
        }
    }

    pub fn to_raw(self, cycle: bool) -> RawTrb {
        let control = LinkTrbControl::new()
            .with_cycle(cycle)
            .with_toggle_cycle(self.toggle_cycle)
            .with_chain(self.chain)
            .with_interrupt_on_completion(true)
            .with_trb_type(TrbType::Link)
            .into();

        RawTrb {
            pointer: self.segment_pointer,
            status: 0,
            control,
        }
    }

    pub fn from_raw(raw: RawTrb) -> Self {
        let control = LinkTrbControl::from(raw.control);
        Self {
            segment_pointer: raw.pointer,
            toggle_cycle: control.toggle_cycle(),
            chain: control.chain(),
        }
    }
}
