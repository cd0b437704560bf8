//! [`DeviceState`]: every per-slot data structure this core owns, plus the state transitions
//! `enumerator`/`endpoint`/`controller` drive it through. One of these exists for every slot ID
//! `1..=max_slots`, allocated up front and reused across plug/unplug cycles.

use alloc::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::contexts::device_context::{endpoint_dci, DeviceContext, EP0_DCI};
use crate::contexts::endpoint_context::{EndpointContext, EndpointType};
use crate::contexts::input_context::{InputContext, InputControlContext, ADD_A0_SLOT, ADD_A1_EP0};
use crate::contexts::slot_context::SlotContext;
use crate::contexts::ContextSize;
use crate::dcbaa::Dcbaa;
use crate::error::{Result, XhciError};
use crate::hal::{DmaBufferFactory, UsbSpeed};
use crate::rings::trb_context::TrbContext;
use crate::rings::transfer_ring::TransferRing;
use crate::ENDPOINTS_PER_SLOT;

/// A Transaction Translator hop for a Low/Full-speed device behind a High-speed hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtInfo {
    /// Slot ID of the hub providing the TT. `0` if this device has no TT (it either is the hub,
    /// or is not behind one).
    pub tt_slot_id: u8,
    /// The hub's downstream port number this device is attached through, for a multi-TT hub.
    pub tt_port_number: u8,
}

/// Topology bookkeeping for a device that is itself a USB hub, or sits behind one.
///
/// Built by [`crate::hub::hub_info_for_child`] by copying a parent hub's own `HubInfo` and
/// folding in the newly attached child's port number, per xHCI §4.3.3's route string
/// construction (route_string |= port << (4 * parent_hub_depth)).
#[derive(Debug, Clone, Copy)]
pub struct HubInfo {
    pub is_hub: bool,
    pub multi_tt: bool,
    /// Number of downstream-facing ports, meaningful only if `is_hub`.
    pub number_of_ports: u8,
    /// Route string accumulated from the root port down to (but not including) this device.
    pub route_string: u32,
    /// Depth of this hub below the root (root hub ports are depth 0); bounds how far the route
    /// string can still be shifted before overflowing its 20 bits.
    pub hub_depth: u8,
    pub root_hub_port_number: u8,
    pub tt: TtInfo,
}

impl Default for HubInfo {
    fn default() -> Self {
        Self {
            is_hub: false,
            multi_tt: false,
            number_of_ports: 0,
            route_string: 0,
            hub_depth: 0,
            root_hub_port_number: 0,
            tt: TtInfo::default(),
        }
    }
}

/// Slot metadata computed once a device's position and speed are known, used to seed its Slot
/// Context. Kept as a free-standing struct rather than threading individual fields through
/// [`DeviceState::address_device_setup`] since most of it comes straight out of a [`HubInfo`].
#[derive(Debug, Clone, Copy)]
pub struct SlotContextParams {
    pub route_string: u32,
    pub speed: UsbSpeed,
    pub root_hub_port_number: u8,
    pub is_hub: bool,
    pub multi_tt: bool,
    pub parent_hub_slot_id: u8,
    pub parent_port_number: u8,
    pub tt_think_time: u8,
}

struct Inner {
    slot_id: u8,
    port: u8,
    hub: Option<HubInfo>,
    /// Set once `UsbHciDeviceOffline`/unbind has started tearing this slot down, so a racing
    /// completion callback or status-change event knows not to touch it further.
    disconnecting: bool,
    input_context: Option<InputContext>,
    output_context: Option<DeviceContext>,
    /// Downstream port number -> child slot ID, populated by [`crate::hub`] as children are
    /// enumerated behind this slot (meaningful only once this slot has been configured as a hub).
    /// Mirrors the source driver's `HubInfo::port_to_device` table, as a sparse map instead of a
    /// fixed 256-entry array.
    hub_children: BTreeMap<u8, u8>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            slot_id: 0,
            port: 0,
            hub: None,
            disconnecting: false,
            input_context: None,
            output_context: None,
            hub_children: BTreeMap::new(),
        }
    }
}

/// Per-slot state: the Input/Output Contexts, the 32 transfer rings, and the topology/identity
/// fields the enumerator and hub code fill in. All field access not involving a ring goes through
/// `transaction_lock`; the rings have their own internal locking (see
/// [`TransferRing`](crate::rings::transfer_ring::TransferRing)'s doc comment) so a long-running
/// transfer never blocks a `slot_id`/`hub` lookup.
pub struct DeviceState {
    inner: Mutex<Inner>,
    /// Index 0 is EP0's control ring; index `dci - 1` for `dci` in `2..=31` is that endpoint's
    /// ring. `None` until `address_device_setup`/`enable_endpoint` allocates it.
    rings: alloc::vec::Vec<Mutex<Option<TransferRing>>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let mut rings = alloc::vec::Vec::with_capacity(ENDPOINTS_PER_SLOT);
        for _ in 0..ENDPOINTS_PER_SLOT {
            rings.push(Mutex::new(None));
        }
        Self {
            inner: Mutex::new(Inner::default()),
            rings,
        }
    }
}

fn ring_index(dci: u8) -> usize {
    debug_assert!((EP0_DCI..=31).contains(&dci));
    usize::from(dci) - 1
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_id(&self) -> u8 {
        self.inner.lock().slot_id
    }

    pub fn port(&self) -> u8 {
        self.inner.lock().port
    }

    pub fn hub(&self) -> Option<HubInfo> {
        self.inner.lock().hub
    }

    pub fn is_disconnecting(&self) -> bool {
        self.inner.lock().disconnecting
    }

    pub fn set_disconnecting(&self, value: bool) {
        self.inner.lock().disconnecting = value;
    }

    /// Records which slot/port/hub this state now belongs to, right after `EnableSlot` completes.
    pub fn set_device_information(&self, slot_id: u8, port: u8, hub: Option<HubInfo>) {
        let mut inner = self.inner.lock();
        inner.slot_id = slot_id;
        inner.port = port;
        inner.hub = hub;
        inner.disconnecting = false;
    }

    /// Records that `child_slot` was enumerated behind this (hub) slot's downstream `port`.
    pub fn record_hub_child(&self, port: u8, child_slot: u8) {
        self.inner.lock().hub_children.insert(port, child_slot);
    }

    /// Removes and returns the slot ID previously recorded for this hub's downstream `port`.
    pub fn take_hub_child(&self, port: u8) -> Option<u8> {
        self.inner.lock().hub_children.remove(&port)
    }

    /// Removes and returns every child slot ID still recorded behind this hub, for recursive
    /// teardown when the hub itself goes offline (its children never see their own port status
    /// change; the controller must walk down and tear each of them down too).
    pub fn drain_hub_children(&self) -> alloc::vec::Vec<u8> {
        let mut inner = self.inner.lock();
        let children = core::mem::take(&mut inner.hub_children);
        children.into_values().collect()
    }

    pub fn input_context_phys(&self) -> u64 {
        self.inner
            .lock()
            .input_context
            .as_ref()
            .map(InputContext::phys_addr)
            .unwrap_or(0)
    }

    /// Drains and returns the pending TRB contexts of every endpoint ring that has one
    /// (including EP0), for `UsbHciCancelAll`/disconnect teardown. The caller completes each with
    /// whatever status applies.
    pub fn take_all_pending(&self) -> VecDeque<TrbContext> {
        let mut all = VecDeque::new();
        for slot in &self.rings {
            if let Some(ring) = slot.lock().as_ref() {
                all.extend(ring.take_pending_trbs());
            }
        }
        all
    }

    /// Returns every slot fully to its power-on state: drops all contexts and rings. Callers must
    /// have already drained/completed pending work (see [`take_all_pending`](Self::take_all_pending))
    /// and published `dcbaa[slot] = 0` before calling this, since the Output Context is dropped
    /// here.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::default();
        drop(inner);
        for slot in &self.rings {
            *slot.lock() = None;
        }
    }

    /// Runs `f` against the control ring (DCI 1), if allocated.
    pub fn with_control_ring<R>(&self, f: impl FnOnce(&TransferRing) -> R) -> Option<R> {
        self.with_ring(EP0_DCI, f)
    }

    /// Runs `f` against the transfer ring at `dci` (`1..=31`), if allocated.
    pub fn with_ring<R>(&self, dci: u8, f: impl FnOnce(&TransferRing) -> R) -> Option<R> {
        let guard = self.rings[ring_index(dci)].lock();
        guard.as_ref().map(f)
    }

    /// Installs a freshly initialized ring at `dci`, replacing (and dropping) whatever was there.
    pub fn install_ring(&self, dci: u8, ring: TransferRing) {
        *self.rings[ring_index(dci)].lock() = Some(ring);
    }

    /// Removes and returns the ring at `dci`, if any (`DisableEndpoint`/slot teardown).
    pub fn take_ring(&self, dci: u8) -> Option<TransferRing> {
        self.rings[ring_index(dci)].lock().take()
    }

    pub fn has_ring(&self, dci: u8) -> bool {
        self.rings[ring_index(dci)].lock().is_some()
    }

    /// The DCI for a non-control endpoint, given its USB endpoint number and direction.
    pub fn dci_for(endpoint_number: u8, direction_in: bool) -> u8 {
        endpoint_dci(endpoint_number, direction_in)
    }

    /// Allocates the Input Context, control ring and Output Context for a freshly enabled slot,
    /// writing the Slot Context and EP0 Endpoint Context, and publishing the Output Context into
    /// the DCBAA. Returns the Input Context's physical address, ready to post in an
    /// `AddressDevice` command.
    ///
    /// Grounded on the source driver's `InitializeSlotBuffer`/`InitializeEndpointContext`/
    /// `InitializeOutputContextBuffer` sequence (xhci-device-state.cc): the control ring and
    /// Input Context must exist before the EP0 Endpoint Context can reference the ring's enqueue
    /// pointer, and the Output Context must be live in the DCBAA before `AddressDevice` is posted
    /// (the controller writes into it as soon as the command completes).
    pub fn address_device_setup(
        &self,
        factory: &dyn DmaBufferFactory,
        page_size: usize,
        context_size: ContextSize,
        is_32bit: bool,
        has_coherent_cache: bool,
        dcbaa: &Dcbaa,
        params: SlotContextParams,
    ) -> Result<u64> {
        let slot_id = self.slot_id();
        if slot_id == 0 {
            return Err(XhciError::BadState);
        }

        let control_ring = TransferRing::init(page_size, is_32bit, has_coherent_cache, factory)?;
        let (enqueue_ptr, pcs) = control_ring.enqueue_pointer();
        self.install_ring(EP0_DCI, control_ring);

        let mut input_context = InputContext::new(factory, page_size, context_size)
            .map_err(|_| XhciError::NoMemory)?;
        input_context.set_control_context(
            InputControlContext::new()
                .with_add_context_flags(ADD_A0_SLOT | ADD_A1_EP0),
        );

        // Only the Slot Context and EP0 are known at this point; ConfigureEndpoint extends
        // context_entries as later interfaces/endpoints are added.
        let slot_context = SlotContext::new()
            .with_route_string(params.route_string)
            .with_speed(params.speed.to_slot_speed())
            .with_multi_tt(params.multi_tt)
            .with_is_hub(params.is_hub)
            .with_context_entries(EP0_DCI)
            .with_root_hub_port_number(params.root_hub_port_number)
            .with_parent_hub_slot_id(params.parent_hub_slot_id)
            .with_parent_port_number(params.parent_port_number)
            .with_tt_think_time(params.tt_think_time)
            .with_interrupter_target(0);
        input_context.set_slot_context(slot_context);

        let ep0_context = EndpointContext::new()
            .with_error_count(3)
            .with_endpoint_type(EndpointType::Control)
            .with_max_packet_size(params.speed.default_ep0_max_packet_size())
            .with_average_trb_length(8)
            .with_tr_dequeue_pointer(enqueue_ptr, pcs);
        input_context.set_endpoint_context(EP0_DCI, ep0_context);

        let input_phys = input_context.phys_addr();

        let output_context = DeviceContext::new(factory, page_size, context_size)
            .map_err(|_| XhciError::NoMemory)?;
        dcbaa.set_output_context(slot_id, output_context.phys_addr());

        let mut inner = self.inner.lock();
        inner.input_context = Some(input_context);
        inner.output_context = Some(output_context);
        drop(inner);

        Ok(input_phys)
    }

    /// Reads back the Output Context's Slot Context after an `AddressDevice`/`ConfigureEndpoint`/
    /// `EvaluateContext` completion, for logging and for driving the enumerator's state machine
    /// off `usb_device_address`/`slot_state`.
    pub fn output_slot_context(&self) -> Option<SlotContext> {
        self.inner.lock().output_context.as_ref().map(DeviceContext::slot_context)
    }

    pub fn output_endpoint_context(&self, dci: u8) -> Option<EndpointContext> {
        self.inner
            .lock()
            .output_context
            .as_ref()
            .map(|ctx| ctx.endpoint_context(dci))
    }

    /// Begins an `EvaluateContext`/`ConfigureEndpoint` input block: clones the current Output
    /// Context's Slot Context into the Input Context (so fields this command doesn't touch are
    /// preserved) and returns the Input Context's physical address, once `f` has stamped whatever
    /// Add/Drop bits and endpoint contexts it needs into the returned builder.
    pub fn begin_input(&self, f: impl FnOnce(&mut InputContext)) -> Result<u64> {
        let mut inner = self.inner.lock();
        let slot_ctx = inner
            .output_context
            .as_ref()
            .map(DeviceContext::slot_context)
            .ok_or(XhciError::BadState)?;
        let input = inner.input_context.as_mut().ok_or(XhciError::BadState)?;
        input.set_control_context(InputControlContext::new());
        input.set_slot_context(slot_ctx);
        f(input);
        Ok(input.phys_addr())
    }
}
