//! The Endpoint Context: one entry per logical endpoint direction in a Device Context.
//! See xHCI §6.2.3.

use bitfield_struct::bitfield;
use core::fmt::Debug;

/// `Endpoint Context.Endpoint State`. See xHCI Table 6-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disabled,
    Running,
    /// Halted by a STALL condition on the bus; recover with `ResetEndpoint` +
    /// `SetTRDequeuePointer`.
    Halted,
    /// Stopped by a `StopEndpoint` command or while recovering from `Halted`.
    Stopped,
    /// Stopped due to a TRB error on the ring.
    Error,
    Reserved(u8),
}

impl EndpointState {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Disabled,
            1 => Self::Running,
            2 => Self::Halted,
            3 => Self::Stopped,
            4 => Self::Error,
            other => Self::Reserved(other as u8),
        }
    }

    const fn into_bits(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Running => 1,
            Self::Halted => 2,
            Self::Stopped => 3,
            Self::Error => 4,
            Self::Reserved(other) => other as u32,
        }
    }
}

/// `Endpoint Context.Endpoint Type`. See xHCI Table 6-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    NotValid,
    IsochOut,
    BulkOut,
    InterruptOut,
    Control,
    IsochIn,
    BulkIn,
    InterruptIn,
}

impl EndpointType {
    pub(crate) const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::NotValid,
            1 => Self::IsochOut,
            2 => Self::BulkOut,
            3 => Self::InterruptOut,
            4 => Self::Control,
            5 => Self::IsochIn,
            6 => Self::BulkIn,
            7 => Self::InterruptIn,
            _ => unreachable!(),
        }
    }

    pub(crate) const fn into_bits(self) -> u32 {
        match self {
            Self::NotValid => 0,
            Self::IsochOut => 1,
            Self::BulkOut => 2,
            Self::InterruptOut => 3,
            Self::Control => 4,
            Self::IsochIn => 5,
            Self::BulkIn => 6,
            Self::InterruptIn => 7,
        }
    }

    /// The `EndpointType` for a non-control endpoint given its transfer type and direction.
    pub fn for_direction(base: EndpointTypeBase, direction_in: bool) -> Self {
        let offset = if direction_in { 4 } else { 0 };
        Self::from_bits(base as u32 + offset)
    }
}

/// The transfer-type component of an endpoint type, independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointTypeBase {
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

#[bitfield(u32, default = false)]
struct EndpointContextDword0 {
    #[bits(3)]
    endpoint_state: EndpointState,
    #[bits(5)]
    __: u8,
    /// Max bursts per interval for SuperSpeed isochronous endpoints; 0 for all other types.
    /// Reserved (read via [`EndpointContext::max_esit_payload`]) when large ESIT payload is
    /// supported.
    #[bits(2)]
    mult: u8,
    /// `0` means no streams (`tr_dequeue_pointer` addresses a Transfer Ring directly); `1..=15`
    /// means a Primary Stream Array with `2^(n+1)` entries.
    #[bits(5)]
    max_primary_streams: u8,
    linear_stream_array: bool,
    interval: u8,
    max_endpoint_service_time_interval_payload_high: u8,
}

#[bitfield(u32, default = false)]
struct EndpointContextDword1 {
    #[bits(1)]
    __: u8,
    /// Retries before the controller gives up and reports a USB Transaction Error; `0` disables
    /// the limit. This core always programs `3`.
    #[bits(2)]
    error_count: u8,
    #[bits(3)]
    endpoint_type: EndpointType,
    #[bits(1)]
    __: u8,
    host_initiate_disable: bool,
    max_burst_size: u8,
    max_packet_size: u16,
}

#[bitfield(u32, default = false)]
struct EndpointContextDword2 {
    dequeue_cycle_state: bool,
    #[bits(3)]
    __: u8,
    #[bits(28)]
    tr_dequeue_pointer_low: u32,
}

#[bitfield(u32, default = false)]
struct EndpointContextDword4 {
    average_trb_length: u16,
    max_endpoint_service_time_interval_payload_low: u16,
}

/// The _Endpoint Context_ data structure. See xHCI §6.2.3.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct EndpointContext {
    dword_0: EndpointContextDword0,
    dword_1: EndpointContextDword1,
    dword_2: EndpointContextDword2,
    tr_dequeue_pointer_high: u32,
    dword_4: EndpointContextDword4,
}

impl EndpointContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_state(&self) -> EndpointState {
        self.dword_0.endpoint_state()
    }

    pub fn interval(&self) -> u8 {
        self.dword_0.interval()
    }

    pub fn with_interval(mut self, interval: u8) -> Self {
        self.dword_0 = self.dword_0.with_interval(interval);
        self
    }

    pub fn max_primary_streams(&self) -> Option<u8> {
        match self.dword_0.max_primary_streams() {
            0 => None,
            n => Some(n),
        }
    }

    /// Max bursts per interval, SuperSpeed isochronous endpoints only. 0 for every other type.
    pub fn mult(&self) -> u8 {
        self.dword_0.mult()
    }

    pub fn with_mult(mut self, mult: u8) -> Self {
        debug_assert!(mult < 4);
        self.dword_0 = self.dword_0.with_mult(mult);
        self
    }

    pub fn error_count(&self) -> u8 {
        self.dword_1.error_count()
    }

    pub fn with_error_count(mut self, error_count: u8) -> Self {
        debug_assert!(error_count < 4);
        self.dword_1 = self.dword_1.with_error_count(error_count);
        self
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.dword_1.endpoint_type()
    }

    pub fn with_endpoint_type(mut self, endpoint_type: EndpointType) -> Self {
        self.dword_1 = self.dword_1.with_endpoint_type(endpoint_type);
        self
    }

    pub fn max_burst_size(&self) -> u8 {
        self.dword_1.max_burst_size()
    }

    pub fn with_max_burst_size(mut self, max_burst_size: u8) -> Self {
        self.dword_1 = self.dword_1.with_max_burst_size(max_burst_size);
        self
    }

    pub fn max_packet_size(&self) -> u16 {
        self.dword_1.max_packet_size()
    }

    pub fn with_max_packet_size(mut self, max_packet_size: u16) -> Self {
        self.dword_1 = self.dword_1.with_max_packet_size(max_packet_size);
        self
    }

    pub fn dequeue_cycle_state(&self) -> bool {
        self.dword_2.dequeue_cycle_state()
    }

    pub fn average_trb_length(&self) -> u16 {
        self.dword_4.average_trb_length()
    }

    pub fn with_average_trb_length(mut self, average_trb_length: u16) -> Self {
        self.dword_4 = self.dword_4.with_average_trb_length(average_trb_length);
        self
    }

    pub fn tr_dequeue_pointer(&self) -> u64 {
        (u64::from(self.tr_dequeue_pointer_high) << 32)
            | (u64::from(self.dword_2.tr_dequeue_pointer_low()) << 4)
    }

    pub fn with_tr_dequeue_pointer(mut self, ptr: u64, dequeue_cycle_state: bool) -> Self {
        debug_assert_eq!(ptr & 0xf, 0, "TR dequeue pointer must be 16-byte aligned");
        self.tr_dequeue_pointer_high = (ptr >> 32) as u32;
        self.dword_2 = self
            .dword_2
            .with_tr_dequeue_pointer_low((ptr >> 4) as u32)
            .with_dequeue_cycle_state(dequeue_cycle_state);
        self
    }

    /// Total bytes transferred during one Endpoint Service Interval Time; 0 for non-periodic
    /// endpoints.
    pub fn max_esit_payload(&self) -> u32 {
        (u32::from(self.dword_0.max_endpoint_service_time_interval_payload_high()) << 16)
            | u32::from(self.dword_4.max_endpoint_service_time_interval_payload_low())
    }

    pub fn with_max_esit_payload(mut self, max_esit_payload: u32) -> Self {
        debug_assert_eq!(max_esit_payload >> 24, 0);
        self.dword_0 = self
            .dword_0
            .with_max_endpoint_service_time_interval_payload_high((max_esit_payload >> 16) as u8);
        self.dword_4 = self
            .dword_4
            .with_max_endpoint_service_time_interval_payload_low(max_esit_payload as u16);
        self
    }
}

impl Debug for EndpointContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EndpointContext")
            .field("endpoint_state", &self.endpoint_state())
            .field("max_primary_streams", &self.max_primary_streams())
            .field("mult", &self.mult())
            .field("interval", &self.interval())
            .field("error_count", &self.error_count())
            .field("endpoint_type", &self.endpoint_type())
            .field("max_burst_size", &self.max_burst_size())
            .field("max_packet_size", &self.max_packet_size())
            .field("dequeue_cycle_state", &self.dequeue_cycle_state())
            .field("tr_dequeue_pointer", &self.tr_dequeue_pointer())
            .field("average_trb_length", &self.average_trb_length())
            .field("max_esit_payload", &self.max_esit_payload())
            .finish()
    }
}
