//! [`UsbXhci`]: the top-level controller object that owns every register set, ring, and
//! per-slot/per-port state table, and wires them together as the [`EventSink`] and
//! [`EnumerationHost`] implementations the rest of this crate is written against.
//!
//! A binding constructs exactly one of these per controller, via [`UsbXhci::init`], and is
//! thereafter responsible for running one IRQ thread per interrupter that calls
//! [`UsbXhci::service_interrupter`] in a loop, plus forwarding `UsbHci*` calls from the bus
//! client onto [`HostControllerApi`].

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::contexts::device_context::{endpoint_dci, EP0_DCI};
use crate::contexts::ContextSize;
use crate::control_pipeline;
use crate::dcbaa::Dcbaa;
use crate::device_state::DeviceState;
use crate::enumerator::{self, EnumerationHost};
use crate::error::{Result, XhciError};
use crate::hal::{
    Bti, DmaBufferFactory, Mmio, SuperSpeedEndpointCompanionDescriptor, Timer, UsbBusClient,
    UsbEndpointDescriptor, UsbHubDescriptor, UsbRequest, UsbSpeed,
};
use crate::hub;
use crate::interrupter::Interrupter;
use crate::normal_pipeline;
use crate::port_state::PortState;
use crate::quirks::PciQuirkHints;
use crate::registers::capability::{
    walk_extended_capabilities, CapabilityRegisters, XECP_ID_USB_LEGACY_SUPPORT,
};
use crate::registers::operational::{
    CommandRingControlRegister, ConfigureRegister, OperationalRegisters, UsbCommand,
};
use crate::registers::runtime::RuntimeRegisters;
use crate::registers::Window;
use crate::rings::event_ring::EventSink;
use crate::rings::{CommandRing, TrbContext};
use crate::trb::command::CommandTrb;
use crate::trb::event::{
    CommandCompletionTrb, CompletionCode, PortStatusChangeTrb, TransferEventTrb,
};
use crate::blocking::Blocking;

/// Ongoing vendor-workaround behavior folded in at [`UsbXhci::init`] from
/// [`crate::quirks::quirks_for_pci_id`]. The Intel EHCI-to-xHCI port switch itself touches PCI
/// configuration space this core has no access to (see [`PciQuirkHints`]'s doc comment) and is
/// assumed already applied by the binding before it calls `init`; only `qemu_quirk` has anything
/// left for this core to act on at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerQuirks {
    /// Qemu/KVM's emulated xHCI controller lets its Command Ring go idle and stop accepting
    /// doorbells after a period of inactivity. When set, a binding should periodically post a
    /// keep-alive Nop via [`UsbXhci::post_command_ring_keepalive`].
    pub qemu_quirk: bool,
}

/// At most one root-hub-port enumeration runs at a time; everything else queues. Hub-child
/// enumeration (driven through [`hub::hub_device_added`]) bypasses this queue entirely — it is
/// already serialized per hub by the hub's own downstream port topology, and the source this
/// core is grounded on never gates it on the root-port queue either.
#[derive(Default)]
struct EnumerationQueue {
    current: Option<u8>,
    pending: VecDeque<u8>,
}

fn dci_for_ep_address(ep_address: u8) -> u8 {
    let endpoint_number = ep_address & 0x0f;
    if endpoint_number == 0 {
        EP0_DCI
    } else {
        endpoint_dci(endpoint_number, ep_address & 0x80 != 0)
    }
}

/// The core xHCI host controller driver. Owns every register window, ring, and per-slot/per-port
/// table; implements [`EventSink`] (the interrupter's dispatch target) and [`EnumerationHost`]
/// (the seam `enumerator`/`endpoint`/`hub`/the pipelines are written against).
pub struct UsbXhci {
    self_weak: Weak<UsbXhci>,

    capability: CapabilityRegisters,
    operational: OperationalRegisters,
    runtime: RuntimeRegisters,
    doorbells: crate::registers::DoorbellRegisters,

    dcbaa: Dcbaa,
    command_ring: CommandRing,
    interrupter: Interrupter,

    devices: Vec<DeviceState>,
    ports: Vec<PortState>,

    bus_client: Once<Arc<dyn UsbBusClient>>,
    factory: Arc<dyn DmaBufferFactory>,
    timer: Arc<dyn Timer>,

    page_size: usize,
    context_size: ContextSize,
    is_32bit: bool,
    has_coherent_cache: bool,

    quirks: ControllerQuirks,
    max_slots: u8,
    max_ports: u8,

    mfindex_wrap_count: Mutex<u64>,
    enumeration_queue: Mutex<EnumerationQueue>,
    running: Mutex<bool>,
}

impl UsbXhci {
    /// Brings the controller up per xHCI §4.12's `Init`: resets it, performs BIOS handoff,
    /// programs the DCBAA/Command Ring/interrupter 0, then blocks (spinning) until a bus client
    /// is attached via [`HostControllerApi::set_bus_interface`] before finally setting `RUN=1`
    /// and waiting for the controller to leave `HCHalted`.
    ///
    /// `bti` supplies the platform's 32-bit-addressing constraint in addition to whatever the
    /// hardware itself reports (`HCCPARAMS1.AC64`); either one being restrictive forces 32-bit
    /// DMA for the whole controller.
    pub fn init(
        mmio: Arc<dyn Mmio>,
        bti: Arc<dyn Bti>,
        has_coherent_cache: bool,
        factory: Arc<dyn DmaBufferFactory>,
        timer: Arc<dyn Timer>,
        quirks: PciQuirkHints,
    ) -> Result<Arc<Self>> {
        if quirks.intel_ehci_xhci_switch {
            log::info!(
                "controller reports the Intel EHCI->xHCI port-switch quirk; binding is expected \
                 to have already performed the PCI config-space switch before calling init"
            );
        }

        let capability = unsafe { CapabilityRegisters::new(Window::new(mmio.clone(), 0)) };
        let cap_len = usize::from(capability.capability_register_length());
        let hcsparams1 = capability.structural_parameters_1();
        let hcsparams2 = capability.structural_parameters_2();
        let hccparams1 = capability.capability_parameters_1();

        let max_slots = hcsparams1.max_device_slots();
        let max_ports = hcsparams1.max_ports();
        let is_32bit = bti.is_32bit() || !hccparams1.addressing_capability_64bit();
        let context_size = hccparams1.context_size();

        let operational = unsafe {
            OperationalRegisters::new(Window::new(mmio.clone(), cap_len), max_ports)
        };

        Self::reset_controller(&operational);
        Self::bios_handoff(&capability);

        let doorbell_base = cap_len + capability.doorbell_offset();
        let doorbells = unsafe {
            crate::registers::DoorbellRegisters::new(Window::new(mmio.clone(), doorbell_base))
        };
        let runtime_base = cap_len + capability.runtime_register_space_offset();
        let runtime = unsafe { RuntimeRegisters::new(Window::new(mmio.clone(), runtime_base)) };

        let page_size = operational.page_size();
        let max_scratchpad_buffers = hcsparams2.max_scratchpad_buffers();

        let dcbaa = Dcbaa::init(
            page_size,
            usize::from(max_slots),
            max_scratchpad_buffers,
            is_32bit,
            has_coherent_cache,
            factory.as_ref(),
        )?;
        operational.set_configure(
            ConfigureRegister::new().with_max_device_slots_enabled(max_slots),
        );
        operational.set_device_context_base_address_array_pointer(dcbaa.phys_addr());
        // Device Notification Control: enable Function Wake (bit 1) only.
        operational.set_device_notification_control(1 << 1);

        let command_ring = CommandRing::init(page_size, is_32bit, has_coherent_cache, factory.as_ref())?;
        let (crcr_ptr, crcr_cycle) = command_ring.initial_crcr_fields();
        operational.set_command_ring_control(
            CommandRingControlRegister::new()
                .with_command_ring_pointer(crcr_ptr)
                .with_ring_cycle_state(crcr_cycle),
        );

        let interrupter = Interrupter::init(
            page_size,
            hcsparams2.erst_max(),
            is_32bit,
            has_coherent_cache,
            &runtime,
            0,
            timer.clone(),
            factory.as_ref(),
        )?;
        // 30 microseconds, in 250ns units.
        interrupter.set_moderation_interval(240);

        let devices = (0..max_slots).map(|_| DeviceState::new()).collect();
        let ports = (0..max_ports).map(|_| PortState::default()).collect();

        let controller = Arc::new_cyclic(|weak| UsbXhci {
            self_weak: weak.clone(),
            capability,
            operational,
            runtime,
            doorbells,
            dcbaa,
            command_ring,
            interrupter,
            devices,
            ports,
            bus_client: Once::new(),
            factory,
            timer,
            page_size,
            context_size,
            is_32bit,
            has_coherent_cache,
            quirks: ControllerQuirks { qemu_quirk: quirks.qemu_quirk },
            max_slots,
            max_ports,
            mfindex_wrap_count: Mutex::new(0),
            enumeration_queue: Mutex::new(EnumerationQueue::default()),
            running: Mutex::new(false),
        });

        // Signal initialization complete; wait for bus interface (xHCI §4.12's `Init`). The bus
        // client is attached from the DDK-interaction thread, which only exists once this
        // constructor has returned an `Arc` to it, so this has to spin rather than block on
        // anything this thread itself could be asked to drive.
        while controller.bus_client.get().is_none() {
            core::hint::spin_loop();
        }

        controller.operational.set_command(
            UsbCommand::new()
                .with_run_stop(true)
                .with_interrupter_enable(true)
                .with_host_system_error_enable(true)
                .with_enable_wrap_event(true),
        );
        while controller.operational.status().host_controller_halted() {
            core::hint::spin_loop();
        }
        *controller.running.lock() = true;

        Ok(controller)
    }

    fn reset_controller(operational: &OperationalRegisters) {
        operational.set_command(operational.command().with_run_stop(false));
        while !operational.status().host_controller_halted() {
            core::hint::spin_loop();
        }
        while operational.status().controller_not_ready() {
            core::hint::spin_loop();
        }
        operational.set_command(operational.command().with_host_controller_reset(true));
        while operational.command().host_controller_reset() {
            core::hint::spin_loop();
        }
        while operational.status().controller_not_ready() {
            core::hint::spin_loop();
        }
    }

    /// Walks the extended capability list; for each USB Legacy Support entry, claims the
    /// controller from the BIOS by setting the OS Owned Semaphore (bit 24) and spinning until
    /// the BIOS Owned Semaphore (bit 16) clears.
    fn bios_handoff(capability: &CapabilityRegisters) {
        walk_extended_capabilities(capability, |entry| {
            if entry.id == XECP_ID_USB_LEGACY_SUPPORT {
                let dword = capability.extended_capability_dword(entry.byte_offset);
                capability.set_extended_capability_dword(entry.byte_offset, dword | (1 << 24));
                while capability.extended_capability_dword(entry.byte_offset) & (1 << 16) != 0 {
                    core::hint::spin_loop();
                }
            }
            true
        });
    }

    /// Returns `self` as the `Arc<dyn EnumerationHost>` every async chain in `enumerator`/
    /// `endpoint`/`hub` needs to own a reference across suspension points.
    fn host(&self) -> Arc<dyn EnumerationHost> {
        self.self_weak.upgrade().expect("UsbXhci dropped while still in use")
    }

    fn check_slot(&self, slot_id: u8) -> Result<()> {
        if slot_id == 0 || usize::from(slot_id) > self.devices.len() {
            return Err(XhciError::InvalidArgs);
        }
        Ok(())
    }

    fn device_id_to_slot(&self, device_id: u8) -> Result<u8> {
        let slot_id = device_id.checked_add(1).ok_or(XhciError::InvalidArgs)?;
        self.check_slot(slot_id)?;
        Ok(slot_id)
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// `(wrap_count * 16384 + MFINDEX) >> 3`, in milliseconds, per xHCI §4.12's `GetCurrentFrame`.
    fn current_frame_ms(&self) -> u64 {
        let wrap = *self.mfindex_wrap_count.lock();
        let mfindex = u64::from(self.runtime.microframe_index());
        (wrap * 16384 + mfindex) >> 3
    }

    /// Drives interrupter 0's event ring. A binding's IRQ thread calls this once per interrupt
    /// firing; this core never spawns its own IRQ thread (see [`crate::hal::MsiInterrupt`]'s doc
    /// comment).
    pub fn service_interrupter(&self) {
        self.interrupter.service(self);
    }

    /// Runs any cooperative timers whose deadline has passed, without touching the event ring.
    /// Useful for a binding whose IRQ wait has a bounded timeout (see [`crate::hal::Timer`]'s
    /// doc comment).
    pub fn poll_timers(&self) {
        self.interrupter.poll_timers();
    }

    /// Quirks this controller was detected with at [`UsbXhci::init`] time, so a binding can
    /// decide whether to call [`UsbXhci::post_command_ring_keepalive`] periodically.
    pub fn quirks(&self) -> ControllerQuirks {
        self.quirks
    }

    /// Quirk workaround: posts a keep-alive Nop on the Command Ring. A binding should call this
    /// periodically (e.g. every few hundred milliseconds) only when
    /// [`ControllerQuirks::qemu_quirk`] is set.
    pub fn post_command_ring_keepalive(&self) -> Result<()> {
        self.command_ring.post_noop(self.factory.as_ref(), &self.doorbells)?;
        Ok(())
    }

    /// Root-hub-port enumeration entry point, serialized through `enumeration_queue`. Hub-child
    /// enumeration goes through [`hub::hub_device_added`] directly and never touches this queue.
    fn request_enumeration(&self, port: u8) {
        let mut queue = self.enumeration_queue.lock();
        if queue.current.is_some() {
            queue.pending.push_back(port);
            return;
        }
        queue.current = Some(port);
        drop(queue);
        enumerator::enumerate_device(self.host(), port, None);
    }

    /// Advances the root-port enumeration queue. Called from [`EnumerationHost::enumeration_finished`];
    /// no-ops for a `port` that isn't the queue's current entry (a hub-child enumeration, or a
    /// stale/duplicate notification), since only root-port enumerations are tracked here.
    fn dequeue_next_enumeration(&self, finished_port: u8) {
        let mut queue = self.enumeration_queue.lock();
        if queue.current != Some(finished_port) {
            return;
        }
        queue.current = queue.pending.pop_front();
        let next = queue.current;
        drop(queue);
        if let Some(next_port) = next {
            enumerator::enumerate_device(self.host(), next_port, None);
        }
    }

    /// Hub-aware teardown for a root-hub port that has dropped link (xHCI §4.3.1's `CCS=0`
    /// path, and testable scenario #6). Recursively tears down any children enumerated behind
    /// this slot if it was itself a hub, then disables the slot.
    fn device_offline(&self, port: u8) {
        let slot_id = self.ports[usize::from(port) - 1].slot_id();
        if slot_id == 0 {
            return;
        }
        self.teardown_slot(slot_id);
    }

    fn teardown_slot(&self, slot_id: u8) {
        if usize::from(slot_id) > self.devices.len() {
            return;
        }
        let device = &self.devices[usize::from(slot_id) - 1];
        if device.is_disconnecting() {
            return;
        }
        device.set_disconnecting(true);

        for child in device.drain_hub_children() {
            self.teardown_slot(child);
        }

        for ctx in device.take_all_pending() {
            Self::fail_pending(ctx, XhciError::IoNotPresent);
        }

        self.bus_client().remove_device(slot_id - 1);

        let dcbaa_entry_slot = slot_id;
        let devices_index = usize::from(slot_id) - 1;
        let host_for_port_clear = self.self_weak.clone();
        let result = self.command_ring.post(
            self.factory.as_ref(),
            &self.doorbells,
            CommandTrb::DisableSlot { slot_id },
            Box::new(move |event: CommandCompletionTrb| {
                if event.completion_code != CompletionCode::Success {
                    log::error!(
                        "DeviceOffline DisableSlot({}) failed: {:?}",
                        slot_id,
                        event.completion_code
                    );
                    return;
                }
                if let Some(controller) = host_for_port_clear.upgrade() {
                    controller.dcbaa.set_output_context(dcbaa_entry_slot, 0);
                    controller.devices[devices_index].reset();
                    for port_state in &controller.ports {
                        if port_state.slot_id() == dcbaa_entry_slot {
                            port_state.set_slot_id(0);
                        }
                    }
                }
            }),
        );
        if let Err(err) = result {
            log::error!("DeviceOffline DisableSlot({}) post failed: {:?}", slot_id, err);
        }
    }

    fn fail_pending(ctx: TrbContext, err: XhciError) {
        if let crate::rings::Completion::Request(request) = ctx.completion {
            (request.complete)(Err(err), 0);
        }
    }

    /// Fatal escalation path (xHCI §7's `BadState` policy, and §4.12's `Shutdown (fatal)`):
    /// halts the controller and marks it not-running; everything still in flight completes
    /// `IoNotPresent` as the teardown walks it, matching `Unbind`'s drain loop.
    fn shutdown_fatal(&self) {
        *self.running.lock() = false;
        self.operational.set_command(self.operational.command().with_run_stop(false));
        while !self.operational.status().host_controller_halted() {
            core::hint::spin_loop();
        }
        log::error!("xHCI controller shut down after a fatal invariant violation");
    }

    fn on_port_status_change_port(&self, port: u8) -> Result<()> {
        let port_index = usize::from(port) - 1;
        if port_index >= self.ports.len() {
            return Ok(());
        }
        let regs = self.operational.port(port);
        let status = regs.status_and_control();
        let port_state = &self.ports[port_index];

        if status.port_config_error_change() {
            return Err(XhciError::BadState);
        }

        let mut ack = status.preserving_changes();
        let mut should_enumerate = false;

        if !status.current_connect_status() {
            port_state.clear_connection_flags();
            if port_state.slot_id() != 0 {
                self.device_offline(port);
            }
        } else if status.port_link_state() == crate::registers::port::PortLinkState::Polling
            && !port_state.is_connected()
        {
            port_state.set_connected(true);
            port_state.set_usb3(false);
            regs.set_status_and_control(
                status.preserving_changes().with_port_reset(true),
            );
        } else if status.port_link_state() != crate::registers::port::PortLinkState::Polling
            && !port_state.is_connected()
        {
            port_state.set_connected(true);
            port_state.set_usb3(true);
        } else if status.port_link_state() == crate::registers::port::PortLinkState::U0
            && status.port_enabled()
            && !port_state.link_active()
            && port_state.is_usb3()
        {
            port_state.set_link_active(true);
            should_enumerate = true;
        } else if status.port_link_state() == crate::registers::port::PortLinkState::U0
            && !port_state.is_usb3()
            && !port_state.link_active()
        {
            port_state.set_link_active(true);
            self.schedule_after_nanos(
                10_000_000,
                Box::new({
                    let weak = self.self_weak.clone();
                    move || {
                        if let Some(controller) = weak.upgrade() {
                            controller.request_enumeration(port);
                        }
                    }
                }),
            );
        }

        if status.over_current_change() {
            log::warn!("port {} over-current transition", port);
            ack = ack.with_over_current_change(true);
        }
        if status.connect_status_change() {
            ack = ack.with_connect_status_change(true);
        }
        if status.port_reset_change() {
            ack = ack.with_port_reset_change(true);
            if status.port_link_state() == crate::registers::port::PortLinkState::U0 {
                should_enumerate = true;
            }
        }
        if status.warm_port_reset_change() {
            ack = ack.with_warm_port_reset_change(true);
            if status.port_link_state() == crate::registers::port::PortLinkState::U0 {
                should_enumerate = true;
            }
        }
        regs.set_status_and_control(ack);
        port_state.fire_pending_wait();

        if should_enumerate {
            self.request_enumeration(port);
        }
        Ok(())
    }
}

impl EventSink for UsbXhci {
    fn on_port_status_change(&self, event: PortStatusChangeTrb) {
        if let Err(XhciError::BadState) = self.on_port_status_change_port(event.port_id) {
            self.shutdown_fatal();
        }
    }

    fn on_command_completion(&self, event: CommandCompletionTrb) {
        if event.completion_code == CompletionCode::SlotNotEnabledError {
            // Stale event for a slot already released; nothing holds a waiter for it anymore.
            return;
        }
        match self.command_ring.ring().complete_trb(event.command_trb_pointer) {
            Ok(ctx) => {
                if let crate::rings::Completion::Command(waiter) = ctx.completion {
                    waiter(event);
                }
            }
            Err(XhciError::BadState) => self.shutdown_fatal(),
            Err(_) => {}
        }
    }

    fn on_transfer_event(&self, event: TransferEventTrb) {
        if event.trb_pointer == 0 || event.completion_code == CompletionCode::EndpointNotEnabledError {
            return;
        }
        if matches!(
            event.completion_code,
            CompletionCode::RingOverrun | CompletionCode::RingUnderrun
        ) {
            return;
        }
        if usize::from(event.slot_id) == 0 || usize::from(event.slot_id) > self.devices.len() {
            return;
        }
        let device = &self.devices[usize::from(event.slot_id) - 1];

        let result = if event.endpoint_id == EP0_DCI {
            control_pipeline::handle_transfer_event(device, event)
        } else {
            normal_pipeline::handle_transfer_event(device, event.endpoint_id, event)
        };

        match result {
            Ok(needs_recovery) => {
                if needs_recovery {
                    crate::endpoint::recover_stall(self.host(), event.slot_id, event.endpoint_id);
                }
            }
            Err(XhciError::BadState) => self.shutdown_fatal(),
            Err(_) => {}
        }
    }

    fn on_host_controller_event(&self, completion_code: CompletionCode) {
        log::error!("host controller event: {:?}", completion_code);
    }

    fn on_mfindex_wrap(&self) {
        *self.mfindex_wrap_count.lock() += 1;
    }
}

impl EnumerationHost for UsbXhci {
    fn factory(&self) -> &dyn DmaBufferFactory {
        self.factory.as_ref()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn context_size(&self) -> ContextSize {
        self.context_size
    }

    fn is_32bit(&self) -> bool {
        self.is_32bit
    }

    fn has_coherent_cache(&self) -> bool {
        self.has_coherent_cache
    }

    fn command_ring(&self) -> &CommandRing {
        &self.command_ring
    }

    fn dcbaa(&self) -> &Dcbaa {
        &self.dcbaa
    }

    fn doorbells(&self) -> &crate::registers::DoorbellRegisters {
        &self.doorbells
    }

    fn device_state(&self, slot_id: u8) -> &DeviceState {
        &self.devices[usize::from(slot_id) - 1]
    }

    fn port_state(&self, port: u8) -> &PortState {
        &self.ports[usize::from(port) - 1]
    }

    fn port_speed(&self, port: u8) -> UsbSpeed {
        let bits = self.operational.port(port).status_and_control().port_speed();
        UsbSpeed::from_slot_speed(bits).unwrap_or(UsbSpeed::Full)
    }

    fn schedule_after_nanos(&self, delay_ns: u64, task: Box<dyn FnOnce() + Send>) {
        self.interrupter.schedule_after_nanos(delay_ns, task);
    }

    fn bus_client(&self) -> &dyn UsbBusClient {
        self.bus_client.get().expect("bus client not yet set").as_ref()
    }

    fn root_hub_device_id(&self, speed: UsbSpeed) -> u8 {
        if speed.is_superspeed() {
            self.max_slots + 1
        } else {
            self.max_slots
        }
    }

    fn enumeration_finished(&self, port: u8) {
        self.dequeue_next_enumeration(port);
    }
}

/// The API surface this core exposes to the bus client, per §6's External Interfaces table.
/// `device_id` everywhere here is `slot_id - 1`, matching [`crate::hal::UsbRequestHeader`].
pub trait HostControllerApi: Send + Sync {
    /// Validates and routes a USB request to the control or normal pipeline. Fails
    /// `IoNotPresent` synchronously if the controller isn't running or the slot is unbound;
    /// otherwise completes asynchronously through `request.complete`.
    fn request_queue(&self, request: UsbRequest);
    /// One-shot: attaches the bus client and unblocks [`UsbXhci::init`]'s bring-up wait.
    fn set_bus_interface(&self, bus_client: Arc<dyn UsbBusClient>);
    /// `MaxSlots + 2`: the two extras are the virtual USB2/USB3 root-hub slots.
    fn max_device_count(&self) -> u8;
    fn enable_endpoint(
        &self,
        device_id: u8,
        speed: UsbSpeed,
        descriptor: UsbEndpointDescriptor,
        ss_companion: Option<SuperSpeedEndpointCompanionDescriptor>,
    ) -> Result<()>;
    fn disable_endpoint(&self, device_id: u8, ep_address: u8) -> Result<()>;
    fn reset_endpoint(&self, device_id: u8, ep_address: u8) -> Result<()>;
    fn cancel_all(&self, device_id: u8, ep_address: u8) -> Result<()>;
    /// `(wrap_count * 16384 + MFINDEX) >> 3` ms; wrap is tracked across [`EventSink::on_mfindex_wrap`]
    /// calls.
    fn current_frame(&self) -> u64;
    fn configure_hub(
        &self,
        device_id: u8,
        speed: UsbSpeed,
        descriptor: UsbHubDescriptor,
    ) -> Result<()>;
    fn hub_device_added(&self, device_id: u8, port: u8, speed: UsbSpeed) -> Result<()>;
    fn hub_device_removed(&self, hub_device_id: u8, port: u8) -> Result<()>;
    fn max_transfer_size(&self, device_id: u8, ep_address: u8) -> Result<u16>;
}

impl HostControllerApi for UsbXhci {
    fn request_queue(&self, request: UsbRequest) {
        if !self.is_running() {
            (request.complete)(Err(XhciError::IoNotPresent), 0);
            return;
        }
        let slot_id = match request.header.device_id.checked_add(1) {
            Some(slot_id) if usize::from(slot_id) <= self.devices.len() => slot_id,
            _ => {
                (request.complete)(Err(XhciError::InvalidArgs), 0);
                return;
            }
        };
        let device = &self.devices[usize::from(slot_id) - 1];
        if device.slot_id() == 0 {
            (request.complete)(Err(XhciError::IoNotPresent), 0);
            return;
        }

        let dci = dci_for_ep_address(request.header.ep_address);
        if dci == EP0_DCI {
            if let Err(err) =
                control_pipeline::queue_control_request(device, slot_id, self.factory.as_ref(), &self.doorbells, request)
            {
                log::warn!("control request queue failed for slot {}: {:?}", slot_id, err);
            }
        } else {
            let current_frame = self.current_frame_ms() as u32;
            if let Err(err) = normal_pipeline::queue_transfer(
                device,
                dci,
                self.factory.as_ref(),
                &self.doorbells,
                slot_id,
                self.timer.as_ref(),
                current_frame,
                request,
            ) {
                log::warn!("transfer queue failed for slot {} dci {}: {:?}", slot_id, dci, err);
            }
        }
    }

    fn set_bus_interface(&self, bus_client: Arc<dyn UsbBusClient>) {
        self.bus_client.call_once(|| bus_client);
    }

    fn max_device_count(&self) -> u8 {
        self.max_slots + 2
    }

    fn enable_endpoint(
        &self,
        device_id: u8,
        speed: UsbSpeed,
        descriptor: UsbEndpointDescriptor,
        ss_companion: Option<SuperSpeedEndpointCompanionDescriptor>,
    ) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        crate::endpoint::enable_endpoint(self.host(), slot_id, speed, descriptor, ss_companion)
    }

    fn disable_endpoint(&self, device_id: u8, ep_address: u8) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        crate::endpoint::disable_endpoint(self.host(), slot_id, ep_address)
    }

    fn reset_endpoint(&self, device_id: u8, ep_address: u8) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        crate::endpoint::reset_endpoint(self.host(), slot_id, ep_address)
    }

    fn cancel_all(&self, device_id: u8, ep_address: u8) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        crate::endpoint::cancel_all(self.host(), slot_id, ep_address)
    }

    fn current_frame(&self) -> u64 {
        self.current_frame_ms()
    }

    fn configure_hub(
        &self,
        device_id: u8,
        speed: UsbSpeed,
        descriptor: UsbHubDescriptor,
    ) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        let blocking = Arc::new(Blocking::new());
        let waiter = blocking.clone();
        hub::configure_hub(
            self.host(),
            slot_id,
            speed,
            descriptor,
            Box::new(move |result| waiter.signal(result)),
        );
        blocking.wait()
    }

    fn hub_device_added(&self, device_id: u8, port: u8, speed: UsbSpeed) -> Result<()> {
        let slot_id = self.device_id_to_slot(device_id)?;
        hub::hub_device_added(self.host(), slot_id, port, speed)
    }

    fn hub_device_removed(&self, hub_device_id: u8, port: u8) -> Result<()> {
        let hub_slot_id = self.device_id_to_slot(hub_device_id)?;
        let blocking = Arc::new(Blocking::new());
        let waiter = blocking.clone();
        hub::hub_device_removed(
            self.host(),
            hub_slot_id,
            port,
            Box::new(move |result| waiter.signal(result)),
        );
        blocking.wait()
    }

    fn max_transfer_size(&self, device_id: u8, ep_address: u8) -> Result<u16> {
        let slot_id = self.device_id_to_slot(device_id)?;
        let dci = dci_for_ep_address(ep_address);
        self.devices[usize::from(slot_id) - 1]
            .output_endpoint_context(dci)
            .map(|ctx| ctx.max_packet_size())
            .ok_or(XhciError::InvalidArgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dci_for_ep_address_targets_ep0_regardless_of_direction() {
        assert_eq!(dci_for_ep_address(0x00), EP0_DCI);
        assert_eq!(dci_for_ep_address(0x80), EP0_DCI);
    }

    #[test]
    fn dci_for_ep_address_matches_endpoint_dci() {
        // ep 1 OUT -> DCI 2, ep 1 IN -> DCI 3, per xHCI table 6-6.
        assert_eq!(dci_for_ep_address(0x01), 2);
        assert_eq!(dci_for_ep_address(0x81), 3);
    }
}
