//! [`CommandTrb`]: TRBs posted to the Command Ring.
//!
//! See xHCI §6.4.3. Each variant corresponds to one TRB Type the controller accepts from the
//! Command Ring; the corresponding completion always arrives as a
//! [`CommandCompletionTrb`](super::event::CommandCompletionTrb) on an event ring.

use bitfield_struct::bitfield;

use super::{link::LinkTrb, RawTrb, TrbType};

#[bitfield(u32)]
struct SlotTargetedControl {
    pub cycle: bool,

    #[bits(9)]
    __: u16,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(8)]
    __: u8,

    pub slot_id: u8,
}

#[bitfield(u32)]
struct AddressDeviceControl {
    pub cycle: bool,

    #[bits(8)]
    __: u8,

    /// Block Set-address Request: when set, the controller assigns the slot's internal
    /// USB address but does not issue the `SET_ADDRESS` request on the bus.
    pub bsr: bool,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(8)]
    __: u8,

    pub slot_id: u8,
}

#[bitfield(u32)]
struct ConfigureEndpointControl {
    pub cycle: bool,

    #[bits(8)]
    __: u8,

    /// Deconfigure: tears down every endpoint but EP0 and returns the slot to the Addressed
    /// state. Not used by this core (endpoints are disabled individually), but represented for
    /// completeness.
    pub deconfigure: bool,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(8)]
    __: u8,

    pub slot_id: u8,
}

#[bitfield(u32)]
struct EndpointTargetedControl {
    pub cycle: bool,

    /// Transfer State Preserve (ResetEndpoint only): keep the endpoint's internal sequence
    /// number/toggle state instead of resetting it.
    pub tsp: bool,

    #[bits(8)]
    __: u8,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(5)]
    pub endpoint_id: u8,

    #[bits(3)]
    __: u8,

    pub slot_id: u8,
}

#[bitfield(u32)]
struct StopEndpointControl {
    pub cycle: bool,

    #[bits(9)]
    __: u16,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(5)]
    pub endpoint_id: u8,

    #[bits(2)]
    __: u8,
    /// Suspend: hint that the endpoint may be re-started soon; no-op in this core.
    pub suspend: bool,

    pub slot_id: u8,
}

#[bitfield(u32)]
struct SetTrDequeuePointerControl {
    pub cycle: bool,

    #[bits(9)]
    __: u16,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(5)]
    pub endpoint_id: u8,

    #[bits(3)]
    __: u8,

    pub slot_id: u8,
}

/// A TRB posted to the Command Ring.
#[derive(Debug, Clone, Copy)]
pub enum CommandTrb {
    Link(LinkTrb),
    EnableSlot,
    DisableSlot {
        slot_id: u8,
    },
    /// `ctx_ptr` is the physical address of the Input Context. `bsr` is Block Set-address
    /// Request (§4.7, retry path).
    AddressDevice {
        slot_id: u8,
        input_ctx_ptr: u64,
        bsr: bool,
    },
    ConfigureEndpoint {
        slot_id: u8,
        input_ctx_ptr: u64,
    },
    EvaluateContext {
        slot_id: u8,
        input_ctx_ptr: u64,
    },
    ResetEndpoint {
        slot_id: u8,
        endpoint_id: u8,
        transfer_state_preserve: bool,
    },
    StopEndpoint {
        slot_id: u8,
        endpoint_id: u8,
    },
    SetTrDequeuePointer {
        slot_id: u8,
        endpoint_id: u8,
        dequeue_ptr: u64,
        dequeue_cycle_state: bool,
    },
    NoOp,
}

impl CommandTrb {
    pub fn to_raw(self, cycle: bool) -> RawTrb {
        match self {
            CommandTrb::Link(link) => link.to_raw(cycle),
            CommandTrb::EnableSlot => RawTrb {
                pointer: 0,
                status: 0,
                control: SlotTargetedControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::EnableSlotCommand)
                    .into(),
            },
            CommandTrb::DisableSlot { slot_id } => RawTrb {
                pointer: 0,
                status: 0,
                control: SlotTargetedControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::DisableSlotCommand)
                    .with_slot_id(slot_id)
                    .into(),
            },
            CommandTrb::AddressDevice {
                slot_id,
                input_ctx_ptr,
                bsr,
            } => {
                debug_assert_eq!(input_ctx_ptr & 0xf, 0, "input context must be 16-byte aligned");
                RawTrb {
                    pointer: input_ctx_ptr,
                    status: 0,
                    control: AddressDeviceControl::new()
                        .with_cycle(cycle)
                        .with_bsr(bsr)
                        .with_trb_type(TrbType::AddressDeviceCommand)
                        .with_slot_id(slot_id)
                        .into(),
                }
            }
            CommandTrb::ConfigureEndpoint {
                slot_id,
                input_ctx_ptr,
            } => RawTrb {
                pointer: input_ctx_ptr,
                status: 0,
                control: ConfigureEndpointControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::ConfigureEndpointCommand)
                    .with_slot_id(slot_id)
                    .into(),
            },
            CommandTrb::EvaluateContext {
                slot_id,
                input_ctx_ptr,
            } => RawTrb {
                pointer: input_ctx_ptr,
                status: 0,
                control: SlotTargetedControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::EvaluateContextCommand)
                    .with_slot_id(slot_id)
                    .into(),
            },
            CommandTrb::ResetEndpoint {
                slot_id,
                endpoint_id,
                transfer_state_preserve,
            } => RawTrb {
                pointer: 0,
                status: 0,
                control: EndpointTargetedControl::new()
                    .with_cycle(cycle)
                    .with_tsp(transfer_state_preserve)
                    .with_trb_type(TrbType::ResetEndpointCommand)
                    .with_endpoint_id(endpoint_id)
                    .with_slot_id(slot_id)
                    .into(),
            },
            CommandTrb::StopEndpoint {
                slot_id,
                endpoint_id,
            } => RawTrb {
                pointer: 0,
                status: 0,
                control: StopEndpointControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::StopEndpointCommand)
                    .with_endpoint_id(endpoint_id)
                    .with_slot_id(slot_id)
                    .into(),
            },
            CommandTrb::SetTrDequeuePointer {
                slot_id,
                endpoint_id,
                dequeue_ptr,
                dequeue_cycle_state,
            } => {
                debug_assert_eq!(dequeue_ptr & 0xf, 0, "dequeue pointer must be 16-byte aligned");
                RawTrb {
                    pointer: dequeue_ptr | u64::from(dequeue_cycle_state),
                    status: 0,
                    control: SetTrDequeuePointerControl::new()
                        .with_cycle(cycle)
                        .with_trb_type(TrbType::SetTrDequeuePointerCommand)
                        .with_endpoint_id(endpoint_id)
                        .with_slot_id(slot_id)
                        .into(),
                }
            }
            CommandTrb::NoOp => RawTrb {
                pointer: 0,
                status: 0,
                control: SlotTargetedControl::new()
                    .with_cycle(cycle)
                    .with_trb_type(TrbType::NoOpCommand)
                    .into(),
            },
        }
    }
}
