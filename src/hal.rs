//! Collaborator traits the core is driven through.
//!
//! None of these are implemented in this crate: they are the seam between the xHCI core and
//! whatever OS driver framework, bus-transaction-initiator and DMA allocator the platform
//! provides. A binding crate implements them once per platform (e.g. a DDK-style bind hook,
//! or a userspace `/dev/mem` + `vfio` shim) and hands the implementations to [`crate::UsbXhci::init`].

use alloc::boxed::Box;
use core::fmt;

/// Translates virtual allocations to bus-physical addresses and back.
///
/// Named "BTI" (Bus Transaction Initiator) after the hardware unit some platforms expose for
/// this purpose; on platforms without an IOMMU distinction this can simply report the identity
/// mapping.
pub trait Bti: Send + Sync {
    /// Whether pointers handed to the controller must fit in 32 bits. Controllers that are not
    /// 64-bit capable ([`CapabilityParameters1::is_64_bit`](crate::registers::capability) being
    /// unset) only understand `u32` physical addresses.
    fn is_32bit(&self) -> bool;
}

/// A single page-sized (or caller-requested-size) DMA-capable allocation.
///
/// Implementors own the backing memory for as long as the `DmaBuffer` is alive; dropping it
/// must make the physical address safe to reuse.
pub trait DmaBuffer: Send + Sync {
    /// Virtual address software can dereference to read or write the buffer.
    fn virt_ptr(&self) -> *mut u8;
    /// Physical (bus) address the controller can be given.
    fn phys_addr(&self) -> u64;
    /// Size of the allocation in bytes.
    fn len(&self) -> usize;
    /// Whether [`len`](DmaBuffer::len) is zero.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Flushes CPU-dirty cache lines covering this buffer to memory. A no-op when the allocation
    /// is cache-coherent with the controller.
    fn flush(&self, offset: usize, len: usize);
    /// Invalidates cache lines covering this buffer so a subsequent read observes what the
    /// controller wrote. A no-op when the allocation is cache-coherent with the controller.
    fn invalidate(&self, offset: usize, len: usize);
}

/// Creates DMA buffers on behalf of the core.
///
/// `page_size` is always honored exactly (the core only ever asks for single pages or small
/// contiguous multiples of the controller's page size); "paged" allocations need not be
/// physically contiguous across pages, while the scratchpad-buffer-array entries and ring
/// segments must each individually be one contiguous, physically-addressable allocation.
pub trait DmaBufferFactory: Send + Sync {
    /// Allocates `size` contiguous, zero-initialized bytes suitable for giving the controller a
    /// pointer to.
    fn allocate(&self, size: usize) -> Result<Box<dyn DmaBuffer>, DmaAllocError>;
}

/// Allocation failed: the platform is out of DMA-capable memory, or (when [`Bti::is_32bit`] is
/// set) no allocation under the 4 GiB boundary was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAllocError;

impl fmt::Display for DmaAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMA allocation failed")
    }
}

/// A raw MMIO window. All register access in this crate goes through this trait so that the
/// core never assumes a particular address space or mapping lifetime.
///
/// # Safety
/// Implementors must guarantee that `base .. base + len` is mapped uncached (or write-combined)
/// for the entire lifetime of the `Mmio` value, and that volatile reads/writes of `u8`/`u16`/
/// `u32`/`u64` at any aligned offset in that range are well-defined hardware register accesses.
pub unsafe trait Mmio: Send + Sync {
    /// Reads a 32-bit register at byte offset `offset` from the window base.
    fn read32(&self, offset: usize) -> u32;
    /// Writes a 32-bit register at byte offset `offset` from the window base.
    fn write32(&self, offset: usize, value: u32);
    /// Reads a 64-bit register at byte offset `offset` from the window base.
    fn read64(&self, offset: usize) -> u64;
    /// Writes a 64-bit register at byte offset `offset` from the window base.
    fn write64(&self, offset: usize, value: u64);
}

/// A monotonic clock, plus the blocking wait the normal-pipeline isochronous scheduling window
/// (xHCI §4.11.2.5) needs from a caller thread.
///
/// The interrupter's own cooperative timers (the enumerator's 10ms USB 2.0 reset-recovery wait,
/// §9.2.6) are *not* driven through [`sleep_until`](Timer::sleep_until): they are polled from
/// [`now_nanos`] every time the interrupter's loop runs, the same way the source driver multiplexes
/// a timer object onto the same async dispatcher as the interrupt. A binding whose IRQ wait can
/// block indefinitely with no other traffic should give the interrupter thread an additional
/// periodic nudge (a short poll timeout is sufficient) so cooperative timers with no concurrent
/// hardware activity still fire close to on time; this core does not assume one and will simply
/// run those continuations late, on the next real interrupt.
pub trait Timer: Send + Sync {
    /// Nanoseconds since an arbitrary but fixed epoch.
    fn now_nanos(&self) -> u64;
    /// Blocks the calling thread until `now_nanos() >= deadline_ns`. Only ever called from a
    /// caller thread queuing an isochronous request; never from the interrupter loop.
    fn sleep_until(&self, deadline_ns: u64);
}

/// The MSI interrupt object for one interrupter.
///
/// The core does not manage an IRQ thread itself (that belongs to the OS driver framework); it
/// only needs to be told when the controller's interrupt has fired, and to acknowledge the
/// kernel-level interrupt object once the event ring has been drained.
pub trait MsiInterrupt: Send {
    /// Blocks (or yields, in an async binding) until the interrupt fires.
    ///
    /// Implemented as a blocking wait in a threaded binding, or as a future poll in an async
    /// one; this crate only calls it from a single dedicated thread/task per interrupter.
    fn wait(&mut self);
    /// Acknowledges the platform-level interrupt object, re-arming it for the next firing.
    fn ack(&mut self);
}

/// The "USB bus" client: the thing upstream of this core that publishes device nodes.
pub trait UsbBusClient: Send + Sync {
    /// A device finished enumeration and is ready to have its descriptors read by upper layers.
    fn add_device(&self, slot: u8, hub: u8, speed: UsbSpeed);
    /// A device's slot was disabled or the device was unplugged.
    fn remove_device(&self, slot: u8);
}

/// Negotiated USB device speed, per xHCI `Slot Context.Speed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    Low,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    /// The xHCI Slot Context `Speed` field encoding (1-indexed; 0 is reserved).
    pub fn to_slot_speed(self) -> u8 {
        match self {
            UsbSpeed::Full => 1,
            UsbSpeed::Low => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
            UsbSpeed::SuperPlus => 5,
        }
    }

    pub fn from_slot_speed(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(UsbSpeed::Full),
            2 => Some(UsbSpeed::Low),
            3 => Some(UsbSpeed::High),
            4 => Some(UsbSpeed::Super),
            5 => Some(UsbSpeed::SuperPlus),
            _ => None,
        }
    }

    /// Default EP0 max packet size for this speed, before `GET_DESCRIPTOR(Device, 8)` reports
    /// the real value (only needed for Full speed, where it varies).
    pub fn default_ep0_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 64,
            UsbSpeed::High => 64,
            UsbSpeed::Super | UsbSpeed::SuperPlus => 512,
        }
    }

    pub fn is_superspeed(self) -> bool {
        matches!(self, UsbSpeed::Super | UsbSpeed::SuperPlus)
    }
}

/// An opaque handle to a queued USB request, plus the scatter-gather view of its data buffer
/// and the header the packaged `usb_request_t` the OS driver framework owns would carry.
///
/// This crate never copies or owns the request's data buffer; it only walks `chunks` to stamp
/// TRBs and reports completion through `complete`.
pub struct UsbRequest {
    pub header: UsbRequestHeader,
    /// The 8-byte `SETUP` packet, for control requests only.
    pub setup: Option<[u8; 8]>,
    /// Scatter-gather chunks of the transfer buffer, already phys-mapped by the framework.
    pub chunks: alloc::vec::Vec<DmaChunk>,
    /// Invoked exactly once with the completion status and number of bytes actually
    /// transferred.
    pub complete: Box<dyn FnOnce(Result<(), crate::error::XhciError>, usize) + Send>,
}

/// One physically-contiguous chunk of a request's data buffer.
#[derive(Debug, Clone, Copy)]
pub struct DmaChunk {
    pub phys_addr: u64,
    pub len: usize,
}

/// The header fields the OS-level `usb_request_t` carries that this core needs to route and
/// queue a request.
#[derive(Debug, Clone, Copy)]
pub struct UsbRequestHeader {
    /// Device ID, i.e. slot id minus one (`device_id == slot_id - 1`).
    pub device_id: u8,
    /// `bEndpointAddress`: bit 7 is direction, bits 3:0 are the endpoint number.
    pub ep_address: u8,
    /// Total requested transfer length; must equal the sum of `chunks[..].len`.
    pub length: u32,
    /// For isochronous requests, the target frame number. `0` means "as soon as possible".
    pub frame: u32,
}

/// The fields of a standard `USB_DT_ENDPOINT` descriptor this core needs to build an Endpoint
/// Context. The OS driver framework parses the device's configuration descriptor and hands these
/// through [`crate::controller::HostControllerApi::enable_endpoint`].
#[derive(Debug, Clone, Copy)]
pub struct UsbEndpointDescriptor {
    /// `bEndpointAddress`: bit 7 is direction, bits 3:0 are the endpoint number.
    pub address: u8,
    /// `bmAttributes` bits 1:0: 0 = Control, 1 = Isoch, 2 = Bulk, 3 = Interrupt.
    pub attributes: u8,
    /// `wMaxPacketSize`, bits 10:0 (bits 12:11 carry the USB 2.0 high-speed-only extra-transaction
    /// encoding, already folded into [`max_burst_size`](SuperSpeedEndpointCompanionDescriptor)
    /// callers derive separately when present).
    pub max_packet_size: u16,
    /// `bInterval`, raw from the wire.
    pub interval: u8,
}

/// The USB 3 SuperSpeed Endpoint Companion descriptor, present only for SuperSpeed(+) endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperSpeedEndpointCompanionDescriptor {
    /// `bMaxBurst`.
    pub max_burst: u8,
    /// `bmAttributes`: for bulk, the max streams exponent; for isoch, the Mult field.
    pub attributes: u8,
}

/// The fields of a standard USB hub descriptor this core needs for `ConfigureHub`.
#[derive(Debug, Clone, Copy)]
pub struct UsbHubDescriptor {
    pub num_ports: u8,
    /// `wHubCharacteristics`, bits 1:0 carry Multi-TT/Single-TT.
    pub characteristics: u16,
}
