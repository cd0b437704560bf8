//! The [`Trb`] primitive and the [`TrbType`] enumeration shared by every ring.
//!
//! A TRB (Transfer Request Block) is a fixed 16-byte unit: a 64-bit `pointer`, a 32-bit
//! `status`, and a 32-bit `control`. Every other TRB flavor (commands, transfer descriptors,
//! events, links) is just a different interpretation of those three words, keyed by the 6-bit
//! `trb_type` field found at the same offset in all of them.

use bitfield_struct::bitfield;

pub mod command;
pub mod event;
pub mod link;
pub mod transfer;

/// The TRB Type field (`Control` bits 10:15). Values above 39 are either reserved or vendor
/// defined; Streams, Force Event and the USB 3.1 extensions named out of scope by this core are
/// intentionally left unhandled by [`TrbType::from_bits`]'s callers rather than given variants
/// nothing ever constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbType {
    Reserved,
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    EvaluateContextCommand,
    ResetEndpointCommand,
    StopEndpointCommand,
    SetTrDequeuePointerCommand,
    ResetDeviceCommand,
    ForceEventCommand,
    NegotiateBandwidthCommand,
    SetLatencyToleranceValueCommand,
    GetPortBandwidthCommand,
    ForceHeaderCommand,
    NoOpCommand,
    GetExtendedPropertyCommand,
    SetExtendedPropertyCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    BandwidthRequestEvent,
    DoorbellEvent,
    HostControllerEvent,
    DeviceNotificationEvent,
    MfIndexWrapEvent,
    Other(u8),
}

impl TrbType {
    pub(crate) const fn from_bits(bits: u32) -> Self {
        use TrbType::*;
        match bits as u8 {
            0 => Reserved,
            1 => Normal,
            2 => SetupStage,
            3 => DataStage,
            4 => StatusStage,
            5 => Isoch,
            6 => Link,
            7 => EventData,
            8 => NoOp,
            9 => EnableSlotCommand,
            10 => DisableSlotCommand,
            11 => AddressDeviceCommand,
            12 => ConfigureEndpointCommand,
            13 => EvaluateContextCommand,
            14 => ResetEndpointCommand,
            15 => StopEndpointCommand,
            16 => SetTrDequeuePointerCommand,
            17 => ResetDeviceCommand,
            18 => ForceEventCommand,
            19 => NegotiateBandwidthCommand,
            20 => SetLatencyToleranceValueCommand,
            21 => GetPortBandwidthCommand,
            22 => ForceHeaderCommand,
            23 => NoOpCommand,
            24 => GetExtendedPropertyCommand,
            25 => SetExtendedPropertyCommand,
            32 => TransferEvent,
            33 => CommandCompletionEvent,
            34 => PortStatusChangeEvent,
            35 => BandwidthRequestEvent,
            36 => DoorbellEvent,
            37 => HostControllerEvent,
            38 => DeviceNotificationEvent,
            39 => MfIndexWrapEvent,
            other => Other(other),
        }
    }

    pub(crate) const fn into_bits(self) -> u32 {
        use TrbType::*;
        (match self {
            Reserved => 0,
            Normal => 1,
            SetupStage => 2,
            DataStage => 3,
            StatusStage => 4,
            Isoch => 5,
            Link => 6,
            EventData => 7,
            NoOp => 8,
            EnableSlotCommand => 9,
            DisableSlotCommand => 10,
            AddressDeviceCommand => 11,
            ConfigureEndpointCommand => 12,
            EvaluateContextCommand => 13,
            ResetEndpointCommand => 14,
            StopEndpointCommand => 15,
            SetTrDequeuePointerCommand => 16,
            ResetDeviceCommand => 17,
            ForceEventCommand => 18,
            NegotiateBandwidthCommand => 19,
            SetLatencyToleranceValueCommand => 20,
            GetPortBandwidthCommand => 21,
            ForceHeaderCommand => 22,
            NoOpCommand => 23,
            GetExtendedPropertyCommand => 24,
            SetExtendedPropertyCommand => 25,
            TransferEvent => 32,
            CommandCompletionEvent => 33,
            PortStatusChangeEvent => 34,
            BandwidthRequestEvent => 35,
            DoorbellEvent => 36,
            HostControllerEvent => 37,
            DeviceNotificationEvent => 38,
            MfIndexWrapEvent => 39,
            Other(t) => t,
        }) as u32
    }
}

/// The low 32 bits of every TRB's third word: cycle bit, per-type flags, and the TRB type.
/// Individual TRB flavors reinterpret the flag bits between `cycle` and `trb_type`; this generic
/// view is only used to classify a TRB that has just been read off a ring.
#[bitfield(u32)]
pub struct GenericTrbFlags {
    pub cycle: bool,
    pub ent: bool,

    #[bits(8)]
    __: u8,

    #[bits(6)]
    pub trb_type: TrbType,

    #[bits(16)]
    __: u16,
}

/// The raw 16-byte layout every TRB shares: a 64-bit pointer/parameter field, a 32-bit status
/// word, and a 32-bit control word. Ring code reads and writes TRBs at this level; the
/// `command`/`event`/`transfer`/`link` submodules build typed views on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawTrb {
    pub pointer: u64,
    pub status: u32,
    pub control: u32,
}

impl RawTrb {
    pub const LEN: usize = 16;

    pub const fn zeroed() -> Self {
        Self {
            pointer: 0,
            status: 0,
            control: 0,
        }
    }

    pub fn cycle(&self) -> bool {
        GenericTrbFlags::from(self.control).cycle()
    }

    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.control = GenericTrbFlags::from(self.control).with_cycle(cycle).into();
        self
    }

    pub fn trb_type(&self) -> TrbType {
        GenericTrbFlags::from(self.control).trb_type()
    }

    pub fn to_parts(self) -> [u32; 4] {
        [
            self.pointer as u32,
            (self.pointer >> 32) as u32,
            self.status,
            self.control,
        ]
    }

    pub fn from_parts(parts: [u32; 4]) -> Self {
        Self {
            pointer: u64::from(parts[0]) | (u64::from(parts[1]) << 32),
            status: parts[2],
            control: parts[3],
        }
    }

    /// Reads a TRB from a ring slot. `Cycle` is observed with acquire ordering: the caller must
    /// not trust any other field until this has been checked against the ring's Consumer/Producer
    /// Cycle State.
    ///
    /// # Safety
    /// `ptr` must be valid for a volatile 16-byte read of a `RawTrb`.
    pub unsafe fn read_volatile(ptr: *const RawTrb) -> Self {
        let trb = unsafe { core::ptr::read_volatile(ptr) };
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
        trb
    }

    /// Writes a TRB to a ring slot with the Cycle bit written last, release-ordered, so the
    /// controller never observes a partially written TD: everything but `control` is published
    /// by a barrier before `control` (which carries Cycle) becomes visible.
    ///
    /// # Safety
    /// `ptr` must be valid for a volatile 16-byte write and must be a slot currently owned by
    /// software (its existing Cycle bit does not match the ring's Producer Cycle State).
    pub unsafe fn write_volatile(ptr: *mut RawTrb, trb: Self) {
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*ptr).pointer), trb.pointer);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*ptr).status), trb.status);
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*ptr).control), trb.control);
        }
    }
}
