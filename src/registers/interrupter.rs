//! One interrupter's register block within the runtime register space. See xHCI §5.5.2.

use bitfield_struct::bitfield;

use super::Window;

/// `IMAN`. See xHCI §5.5.2.1.
#[bitfield(u32, default = false)]
pub struct InterrupterManagement {
    /// Set by the controller whenever this interrupter has an unacknowledged event. Write `true`
    /// to clear, after draining the event ring.
    pub interrupt_pending: bool,
    pub interrupt_enable: bool,
    #[bits(30)]
    __: u32,
}

/// `IMOD`. See xHCI §5.5.2.2.
#[bitfield(u32, default = false)]
pub struct InterrupterModeration {
    /// Minimum spacing between interrupts, in 250ns units. 0 disables moderation.
    pub interval: u16,
    /// Countdown timer, reloaded from `interval` each time it reaches 0 with events pending.
    pub counter: u16,
}

/// `ERSTSZ`. See xHCI §5.5.2.3.1.
#[bitfield(u32, default = false)]
pub struct EventRingSegmentTableSize {
    pub segment_table_entries: u16,
    #[bits(16)]
    __: u16,
}

/// `ERDP`. See xHCI §5.5.2.3.3.
#[bitfield(u64, default = false)]
pub struct EventRingDequeuePointer {
    #[bits(3)]
    pub dequeue_erst_segment_index: u8,
    /// Set by the controller while it is between writing an event and the interrupt for it being
    /// serviced; write `true` to clear once the event has actually been consumed.
    pub event_handler_busy: bool,
    #[bits(60)]
    dequeue_pointer_shifted: u64,
}

impl EventRingDequeuePointer {
    pub fn dequeue_pointer(&self) -> u64 {
        self.dequeue_pointer_shifted() << 4
    }

    pub fn with_dequeue_pointer(self, addr: u64) -> Self {
        debug_assert_eq!(addr & 0xf, 0, "event ring dequeue pointer must be 16-byte aligned");
        self.with_dequeue_pointer_shifted(addr >> 4)
    }
}

const IMAN: usize = 0x00;
const IMOD: usize = 0x04;
const ERSTSZ: usize = 0x08;
const ERSTBA: usize = 0x10;
const ERDP: usize = 0x18;

/// One interrupter's registers: interrupt management/moderation, and the Event Ring Segment
/// Table base/size/dequeue-pointer that tell the controller where to write events for it.
pub struct InterrupterRegisterSet {
    window: Window,
}

impl InterrupterRegisterSet {
    pub(crate) fn new(window: Window) -> Self {
        Self { window }
    }

    pub fn management(&self) -> InterrupterManagement {
        InterrupterManagement::from(self.window.read32(IMAN))
    }

    pub fn set_management(&self, value: InterrupterManagement) {
        self.window.write32(IMAN, value.into());
    }

    pub fn moderation(&self) -> InterrupterModeration {
        InterrupterModeration::from(self.window.read32(IMOD))
    }

    pub fn set_moderation(&self, value: InterrupterModeration) {
        self.window.write32(IMOD, value.into());
    }

    pub fn event_ring_segment_table_size(&self) -> EventRingSegmentTableSize {
        EventRingSegmentTableSize::from(self.window.read32(ERSTSZ))
    }

    pub fn set_event_ring_segment_table_size(&self, value: EventRingSegmentTableSize) {
        self.window.write32(ERSTSZ, value.into());
    }

    pub fn event_ring_segment_table_base_address(&self) -> u64 {
        self.window.read64(ERSTBA) & !0x3f
    }

    pub fn set_event_ring_segment_table_base_address(&self, addr: u64) {
        debug_assert_eq!(addr & 0x3f, 0, "ERST must be 64-byte aligned");
        self.window.write64(ERSTBA, addr);
    }

    pub fn event_ring_dequeue_pointer(&self) -> EventRingDequeuePointer {
        EventRingDequeuePointer::from(self.window.read64(ERDP))
    }

    pub fn set_event_ring_dequeue_pointer(&self, value: EventRingDequeuePointer) {
        self.window.write64(ERDP, value.into());
    }
}
