//! [`TransferTrb`]: TRBs posted to a Transfer Ring (control, bulk, interrupt or isochronous).
//!
//! See xHCI §6.4.1. Every variant but [`TransferTrb::Link`] produces a
//! [`TransferEventTrb`](super::event::TransferEventTrb) once consumed (unless Interrupt On
//! Completion was left unset and nothing went wrong).

use bitfield_struct::bitfield;

use super::{link::LinkTrb, RawTrb, TrbType};

#[bitfield(u32)]
struct DataControl {
    pub cycle: bool,
    pub ent: bool,
    /// Interrupt-on Short Packet.
    pub isp: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    /// Immediate Data: when set, `pointer` carries up to 8 bytes of data directly rather than a
    /// buffer address.
    pub idt: bool,

    #[bits(2)]
    __: u8,
    /// Block Event Interrupt: suppress the interrupt this TRB would otherwise generate, used to
    /// coalesce completions for long scatter-gather TDs.
    pub bei: bool,

    #[bits(6)]
    pub trb_type: TrbType,
    /// Direction: meaningful only on a DataStage TRB (`true` = IN).
    pub direction_in: bool,

    #[bits(15)]
    __: u16,
}

#[bitfield(u32)]
struct DataStatus {
    #[bits(17)]
    pub trb_transfer_length: u32,
    #[bits(5)]
    pub td_size: u8,
    #[bits(10)]
    pub interrupter_target: u16,
}

#[bitfield(u32)]
struct SetupControl {
    pub cycle: bool,

    #[bits(4)]
    __: u8,

    pub interrupt_on_completion: bool,
    /// Always set: the 8 setup bytes live directly in `pointer`.
    pub idt: bool,

    #[bits(2)]
    __: u8,

    #[bits(6)]
    pub trb_type: TrbType,
    /// Transfer Type: 0 = no data stage, 2 = OUT data stage, 3 = IN data stage.
    #[bits(2)]
    pub trt: u8,

    #[bits(14)]
    __: u16,
}

#[bitfield(u32)]
struct StatusStageControl {
    pub cycle: bool,
    pub ent: bool,

    #[bits(2)]
    __: u8,

    pub chain: bool,
    pub interrupt_on_completion: bool,

    #[bits(3)]
    __: u8,

    #[bits(6)]
    pub trb_type: TrbType,
    pub direction_in: bool,

    #[bits(15)]
    __: u16,
}

#[bitfield(u32)]
struct IsochControl {
    pub cycle: bool,
    pub ent: bool,
    pub isp: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub interrupt_on_completion: bool,
    pub idt: bool,
    /// Transfer Burst Count: (bursts required - 1), superspeed only.
    #[bits(2)]
    pub tbc: u8,
    pub bei: bool,

    #[bits(6)]
    pub trb_type: TrbType,
    /// Transfer Last Burst Packet Count: (packets in the last burst - 1), superspeed only.
    #[bits(4)]
    pub tlbpc: u8,
    #[bits(11)]
    pub frame_id: u16,
    /// Start Isoch ASAP: ignore `frame_id` and schedule at the controller's next opportunity.
    pub sia: bool,
}

#[bitfield(u32)]
struct EventDataControl {
    pub cycle: bool,
    /// Always set on an EventData TRB: tells the completing
    /// [`TransferEventTrb`](super::event::TransferEventTrb) to carry this TRB's `pointer` verbatim
    /// instead of the address of the TD's last TRB.
    pub ent: bool,

    #[bits(2)]
    __: u8,

    pub chain: bool,
    pub interrupt_on_completion: bool,
    #[bits(2)]
    __: u8,
    pub bei: bool,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(16)]
    __: u16,
}

/// Reads the `TRB Transfer Length` field out of a raw TRB's status word. Valid for any TRB flavor
/// that carries one (Normal/SetupStage/DataStage/Isoch); used to walk a TD's TRBs by physical
/// address alone, without reconstructing which [`TransferTrb`] variant each one is.
pub(crate) fn trb_transfer_length(raw: &RawTrb) -> u32 {
    DataStatus::from(raw.status).trb_transfer_length()
}

/// A TRB posted to a Transfer Ring.
#[derive(Debug, Clone, Copy)]
pub enum TransferTrb {
    Link(LinkTrb),
    /// A bulk/interrupt data-stage TRB, also used for all non-EP0 transfers.
    Normal {
        data_buffer: u64,
        trb_transfer_length: u32,
        td_size: u8,
        interrupter_target: u16,
        interrupt_on_completion: bool,
        isp: bool,
        chain: bool,
        immediate_data: bool,
    },
    /// The first TRB of a control transfer; `setup_packet` is packed directly into the TRB's
    /// parameter field (Immediate Data is implicit).
    SetupStage {
        setup_packet: [u8; 8],
        /// `None` for a no-data-stage control request.
        data_stage_direction_in: Option<bool>,
    },
    DataStage {
        data_buffer: u64,
        trb_transfer_length: u32,
        td_size: u8,
        interrupter_target: u16,
        direction_in: bool,
        chain: bool,
        /// Interrupt-on Short Packet: report a `ShortPacket` event against this TRB the moment
        /// the device sends less than `trb_transfer_length`, instead of only at Status Stage.
        isp: bool,
    },
    StatusStage {
        direction_in: bool,
        interrupt_on_completion: bool,
    },
    Isoch {
        data_buffer: u64,
        trb_transfer_length: u32,
        td_size: u8,
        interrupter_target: u16,
        interrupt_on_completion: bool,
        transfer_burst_count: u8,
        last_burst_packet_count: u8,
        start_isoch_asap: bool,
        frame_id: u16,
    },
    /// Carries a caller-chosen value through to the completing event's `trb_pointer`. Used by
    /// the normal transfer pipeline to identify which queued [`crate::hal::UsbRequest`] a
    /// multi-TRB TD's completion belongs to without walking the ring.
    EventData {
        data: u64,
        chain: bool,
        interrupt_on_completion: bool,
    },
    NoOp {
        chain: bool,
        interrupt_on_completion: bool,
    },
}

impl TransferTrb {
    pub fn to_raw(self, cycle: bool) -> RawTrb {
        match self {
            TransferTrb::Link(link) => link.to_raw(cycle),
            TransferTrb::Normal {
                data_buffer,
                trb_transfer_length,
                td_size,
                interrupter_target,
                interrupt_on_completion,
                isp,
                chain,
                immediate_data,
            } => RawTrb {
                pointer: data_buffer,
                status: DataStatus::new()
                    .with_trb_transfer_length(trb_transfer_length)
                    .with_td_size(td_size)
                    .with_interrupter_target(interrupter_target)
                    .into(),
                control: DataControl::new()
                    .with_cycle(cycle)
                    .with_isp(isp)
                    .with_chain(chain)
                    .with_interrupt_on_completion(interrupt_on_completion)
                    .with_idt(immediate_data)
                    .with_trb_type(TrbType::Normal)
                    .into(),
            },
            TransferTrb::SetupStage {
                setup_packet,
                data_stage_direction_in,
            } => RawTrb {
                pointer: u64::from_le_bytes(setup_packet),
                status: DataStatus::new().with_trb_transfer_length(8).into(),
                control: SetupControl::new()
                    .with_cycle(cycle)
                    .with_idt(true)
                    .with_interrupt_on_completion(false)
                    .with_trb_type(TrbType::SetupStage)
                    .with_trt(match data_stage_direction_in {
                        None => 0,
                        Some(false) => 2,
                        Some(true) => 3,
                    })
                    .into(),
            },
            TransferTrb::DataStage {
                data_buffer,
                trb_transfer_length,
                td_size,
                interrupter_target,
                direction_in,
                chain,
            } => RawTrb {
                pointer: data_buffer,
                status: DataStatus::new()
                    .with_trb_transfer_length(trb_transfer_length)
                    .with_td_size(td_size)
                    .with_interrupter_target(interrupter_target)
                    .into(),
                control: DataControl::new()
                    .with_cycle(cycle)
                    .with_chain(chain)
                    .with_trb_type(TrbType::DataStage)
                    .with_direction_in(direction_in)
                    .into(),
            },
            TransferTrb::StatusStage {
                direction_in,
                interrupt_on_completion,
            } => RawTrb {
                pointer: 0,
                status: 0,
                control: StatusStageControl::new()
                    .with_cycle(cycle)
                    .with_interrupt_on_completion(interrupt_on_completion)
                    .with_trb_type(TrbType::StatusStage)
                    .with_direction_in(direction_in)
                    .into(),
            },
            TransferTrb::Isoch {
                data_buffer,
                trb_transfer_length,
                td_size,
                interrupter_target,
                interrupt_on_completion,
                transfer_burst_count,
                last_burst_packet_count,
                start_isoch_asap,
                frame_id,
            } => RawTrb {
                pointer: data_buffer,
                status: DataStatus::new()
                    .with_trb_transfer_length(trb_transfer_length)
                    .with_td_size(td_size)
                    .with_interrupter_target(interrupter_target)
                    .into(),
                control: IsochControl::new()
                    .with_cycle(cycle)
                    .with_interrupt_on_completion(interrupt_on_completion)
                    .with_tbc(transfer_burst_count)
                    .with_tlbpc(last_burst_packet_count)
                    .with_trb_type(TrbType::Isoch)
                    .with_sia(start_isoch_asap)
                    .with_frame_id(frame_id)
                    .into(),
            },
            TransferTrb::EventData {
                data,
                chain,
                interrupt_on_completion,
            } => RawTrb {
                pointer: data,
                status: 0,
                control: EventDataControl::new()
                    .with_cycle(cycle)
                    .with_ent(true)
                    .with_chain(chain)
                    .with_interrupt_on_completion(interrupt_on_completion)
                    .with_trb_type(TrbType::EventData)
                    .into(),
            },
            TransferTrb::NoOp {
                chain,
                interrupt_on_completion,
            } => RawTrb {
                pointer: 0,
                status: 0,
                control: EventDataControl::new()
                    .with_cycle(cycle)
                    .with_chain(chain)
                    .with_interrupt_on_completion(interrupt_on_completion)
                    .with_trb_type(TrbType::NoOp)
                    .into(),
            },
        }
    }

    /// The Chain bit this TRB was (or will be) written with. Ring code needs this to set a
    /// following Link TRB's own Chain bit to match, keeping a TD that spans a segment boundary
    /// contiguous in the controller's eyes.
    pub fn chain(&self) -> bool {
        match self {
            TransferTrb::Link(link) => link.chain,
            TransferTrb::Normal { chain, .. } => *chain,
            TransferTrb::DataStage { chain, .. } => *chain,
            TransferTrb::EventData { chain, .. } => *chain,
            TransferTrb::NoOp { chain, .. } => *chain,
            TransferTrb::SetupStage { .. } => true,
            TransferTrb::StatusStage { .. } => false,
            TransferTrb::Isoch { .. } => false,
        }
    }
}
