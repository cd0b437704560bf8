//! [`EventTrb`]: TRBs the controller writes to an event ring.
//!
//! See xHCI §6.4.2. Every event carries a [`CompletionCode`]; ring code is responsible for
//! routing each variant to the interrupter task that is waiting on it.

use super::{GenericTrbFlags, RawTrb, TrbType};

/// The `Completion Code` field carried by (almost) every event TRB. See xHCI Table 6-90.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailableError,
    InvalidStreamTypeError,
    SlotNotEnabledError,
    EndpointNotEnabledError,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFullError,
    ParameterError,
    BandwidthOverrunError,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStoppedError,
    CommandAbortedError,
    StoppedError,
    StoppedLengthInvalidError,
    StoppedShortPacketError,
    MaxExitLatencyTooLargeError,
    IsochBufferOverrunError,
    EventLostError,
    UndefinedError,
    InvalidStreamIdError,
    SecondaryBandwidthError,
    SplitTransactionError,
    Other(u8),
}

impl CompletionCode {
    pub fn new(bits: u8) -> Self {
        use CompletionCode::*;
        match bits {
            0 => Invalid,
            1 => Success,
            2 => DataBufferError,
            3 => BabbleDetectedError,
            4 => UsbTransactionError,
            5 => TrbError,
            6 => StallError,
            7 => ResourceError,
            8 => BandwidthError,
            9 => NoSlotsAvailableError,
            10 => InvalidStreamTypeError,
            11 => SlotNotEnabledError,
            12 => EndpointNotEnabledError,
            13 => ShortPacket,
            14 => RingUnderrun,
            15 => RingOverrun,
            16 => VfEventRingFullError,
            17 => ParameterError,
            18 => BandwidthOverrunError,
            19 => ContextStateError,
            20 => NoPingResponseError,
            21 => EventRingFullError,
            22 => IncompatibleDeviceError,
            23 => MissedServiceError,
            24 => CommandRingStoppedError,
            25 => CommandAbortedError,
            26 => StoppedError,
            27 => StoppedLengthInvalidError,
            28 => StoppedShortPacketError,
            29 => MaxExitLatencyTooLargeError,
            31 => IsochBufferOverrunError,
            32 => EventLostError,
            33 => UndefinedError,
            34 => InvalidStreamIdError,
            35 => SecondaryBandwidthError,
            36 => SplitTransactionError,
            other => Other(other),
        }
    }

    /// Whether this is one of the two codes that still carry a valid `bytes_transferred` on a
    /// Transfer Event (a full short packet still moved data).
    pub fn is_success_like(self) -> bool {
        matches!(self, CompletionCode::Success | CompletionCode::ShortPacket)
    }
}

/// A _Transfer Event_: reports the completion (or failure) of one TRB on a transfer ring.
#[derive(Debug, Clone, Copy)]
pub struct TransferEventTrb {
    /// Address of the TRB this event reports on, or (for a ring-stopped event) the dequeue
    /// pointer the ring should resume from.
    pub trb_pointer: u64,
    /// Remaining untransferred length. For a successful Normal TRB this is 0; for
    /// [`CompletionCode::ShortPacket`] it is the number of bytes the device didn't send.
    pub transfer_length_remaining: u32,
    pub completion_code: CompletionCode,
    pub slot_id: u8,
    pub endpoint_id: u8,
    /// Event Data: set when this event was generated by an EventData TRB rather than directly
    /// by the TRB at `trb_pointer`.
    pub event_data: bool,
}

impl TransferEventTrb {
    fn from_raw(raw: RawTrb) -> Self {
        let flags = GenericTrbFlags::from(raw.control);
        Self {
            trb_pointer: raw.pointer,
            transfer_length_remaining: raw.status & 0x00ff_ffff,
            completion_code: CompletionCode::new((raw.status >> 24) as u8),
            slot_id: (raw.control >> 24) as u8,
            endpoint_id: ((raw.control >> 16) & 0x1f) as u8,
            event_data: flags.ent(),
        }
    }
}

/// A _Command Completion Event_: reports the completion of one TRB on the Command Ring.
#[derive(Debug, Clone, Copy)]
pub struct CommandCompletionTrb {
    /// Physical address of the completed command TRB.
    pub command_trb_pointer: u64,
    pub completion_code: CompletionCode,
    pub slot_id: u8,
    /// Valid only for `EnableSlotCommand` completions.
    pub vf_id: u8,
}

impl CommandCompletionTrb {
    fn from_raw(raw: RawTrb) -> Self {
        Self {
            command_trb_pointer: raw.pointer,
            completion_code: CompletionCode::new((raw.status >> 24) as u8),
            slot_id: (raw.control >> 24) as u8,
            vf_id: ((raw.control >> 16) & 0xff) as u8,
        }
    }
}

/// A _Port Status Change Event_: one of the port registers' change bits was set. See xHCI
/// §4.19.2.
#[derive(Debug, Clone, Copy)]
pub struct PortStatusChangeTrb {
    /// 1-indexed port number (matches `PORTSC` register array indexing).
    pub port_id: u8,
    pub completion_code: CompletionCode,
}

impl PortStatusChangeTrb {
    fn from_raw(raw: RawTrb) -> Self {
        Self {
            port_id: (raw.pointer >> 24) as u8,
            completion_code: CompletionCode::new((raw.status >> 24) as u8),
        }
    }
}

/// Sent once per roughly 2^14 microframes (about 2 seconds) as `MFINDEX` wraps back to 0. Used
/// to keep isochronous scheduling windows anchored without polling the register continuously.
#[derive(Debug, Clone, Copy)]
pub struct MfIndexWrapTrb;

/// An event read from an event ring.
#[derive(Debug, Clone, Copy)]
pub enum EventTrb {
    Transfer(TransferEventTrb),
    CommandCompletion(CommandCompletionTrb),
    PortStatusChange(PortStatusChangeTrb),
    BandwidthRequest { slot_id: u8 },
    Doorbell,
    HostController { completion_code: CompletionCode },
    DeviceNotification { slot_id: u8 },
    MfIndexWrap(MfIndexWrapTrb),
    /// A TRB type this core does not generate or recognize as an event (streams, VF events,
    /// vendor-defined types).
    Unknown(TrbType),
}

impl EventTrb {
    pub fn from_raw(raw: RawTrb) -> Self {
        match raw.trb_type() {
            TrbType::TransferEvent => EventTrb::Transfer(TransferEventTrb::from_raw(raw)),
            TrbType::CommandCompletionEvent => {
                EventTrb::CommandCompletion(CommandCompletionTrb::from_raw(raw))
            }
            TrbType::PortStatusChangeEvent => {
                EventTrb::PortStatusChange(PortStatusChangeTrb::from_raw(raw))
            }
            TrbType::BandwidthRequestEvent => EventTrb::BandwidthRequest {
                slot_id: (raw.control >> 24) as u8,
            },
            TrbType::DoorbellEvent => EventTrb::Doorbell,
            TrbType::HostControllerEvent => EventTrb::HostController {
                completion_code: CompletionCode::new((raw.status >> 24) as u8),
            },
            TrbType::DeviceNotificationEvent => EventTrb::DeviceNotification {
                slot_id: (raw.control >> 24) as u8,
            },
            TrbType::MfIndexWrapEvent => EventTrb::MfIndexWrap(MfIndexWrapTrb),
            other => EventTrb::Unknown(other),
        }
    }
}
