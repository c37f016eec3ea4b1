//! OHCI (USB 1.1) host controller model.
//!
//! The controller exposes the 25 OHCI operational registers through [`OhciController::mmio_read`]
//! / [`OhciController::mmio_write`] and runs one frame pass per USB frame (1 ms of guest time)
//! whenever the bus is Operational. A frame pass:
//! - services the periodic (interrupt + isochronous) list selected by the frame number,
//! - services the control and bulk lists while they are enabled and marked filled,
//! - advances `HcFmNumber` and mirrors it into the HCCA,
//! - flushes the Done Queue into the HCCA once the interrupt delay counter expires.
//!
//! Packets are handed to an injected [`UsbDeviceStack`]. At most one general TD may be
//! outstanding asynchronously; its completion re-runs the control and bulk lists in completion
//! mode (see [`OhciController::async_complete`]).
//!
//! Guest memory failures are the only fatal condition: they raise `UnrecoverableError` and stop
//! the bus until the next reset.

pub mod descriptor;
mod hub;
mod iso;
mod schedule;
mod timer;

pub mod regs;

pub use descriptor::{ConditionCode, DescriptorFault, Ed, Hcca, IsoTd, Td};
pub use hub::{RootHub, RootPort};
pub use timer::{FrameTimer, FRAME_PERIOD_NS, USB_HZ};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::HostClock;
use crate::device::{DeviceId, UsbDeviceStack, UsbPacket, UsbSpeed};
use crate::memory::GuestMemory;

use descriptor::DPTR_MASK;
use regs::*;
use schedule::{service_ed_list, DoneQueue, ScheduleContext, TransferState};

/// Runtime knobs of the controller model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OhciConfig {
    /// Guest nanoseconds per USB frame.
    pub frame_period_ns: u64,
    /// Most frame passes a single [`OhciController::poll`] runs before dropping the backlog.
    pub max_catch_up_frames: usize,
    /// Sleep between polls of the background frame worker.
    pub worker_poll_interval: Duration,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            frame_period_ns: FRAME_PERIOD_NS,
            max_catch_up_frames: 16,
            worker_poll_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OhciRegs {
    control: u32,
    command_status: u32,
    interrupt_status: u32,
    /// `HcInterruptEnable`/`HcInterruptDisable` both operate on this mask.
    interrupt_enable: u32,
    hcca: u32,
    period_current_ed: u32,
    control_head_ed: u32,
    control_current_ed: u32,
    bulk_head_ed: u32,
    bulk_current_ed: u32,
    fm_interval: u32,
    /// Only the FRT bit is stored; the remaining count is derived from the frame timer.
    fm_remaining: u32,
    fm_number: u16,
    periodic_start: u32,
    ls_threshold: u32,
    rh_descriptor_a: u32,
    rh_descriptor_b: u32,
}

impl OhciRegs {
    fn new() -> Self {
        Self {
            control: 0,
            command_status: 0,
            interrupt_status: 0,
            interrupt_enable: INT_MIE,
            hcca: 0,
            period_current_ed: 0,
            control_head_ed: 0,
            control_current_ed: 0,
            bulk_head_ed: 0,
            bulk_current_ed: 0,
            fm_interval: HC_FM_INTERVAL_DEFAULT,
            fm_remaining: 0,
            fm_number: 0,
            periodic_start: 0,
            ls_threshold: HC_LS_THRESHOLD_DEFAULT,
            rh_descriptor_a: HC_RH_DESCRIPTOR_A_DEFAULT,
            rh_descriptor_b: 0,
        }
    }

    fn state(&self) -> HcState {
        HcState::from_control(self.control)
    }

    fn masked_slot(&mut self, offset: u64) -> Option<&mut u32> {
        Some(match offset {
            REG_HC_HCCA => &mut self.hcca,
            REG_HC_CONTROL_HEAD_ED => &mut self.control_head_ed,
            REG_HC_CONTROL_CURRENT_ED => &mut self.control_current_ed,
            REG_HC_BULK_HEAD_ED => &mut self.bulk_head_ed,
            REG_HC_BULK_CURRENT_ED => &mut self.bulk_current_ed,
            REG_HC_FM_INTERVAL => &mut self.fm_interval,
            REG_HC_PERIODIC_START => &mut self.periodic_start,
            REG_HC_LS_THRESHOLD => &mut self.ls_threshold,
            REG_HC_RH_DESCRIPTOR_A => &mut self.rh_descriptor_a,
            _ => return None,
        })
    }
}

pub struct OhciController {
    config: OhciConfig,
    regs: OhciRegs,
    hub: RootHub,
    transfers: TransferState,
    timer: FrameTimer,
    /// `HcControl` as seen by the previous frame pass, for list-disable edge detection.
    old_control: u32,
    irq_level: bool,
    mem: Arc<dyn GuestMemory>,
    stack: Box<dyn UsbDeviceStack>,
    clock: Arc<dyn HostClock>,
}

impl OhciController {
    pub fn new(
        config: OhciConfig,
        mem: Arc<dyn GuestMemory>,
        stack: Box<dyn UsbDeviceStack>,
        clock: Arc<dyn HostClock>,
    ) -> Self {
        let mut ctrl = Self {
            config,
            regs: OhciRegs::new(),
            hub: RootHub::new(),
            transfers: TransferState::default(),
            timer: FrameTimer::new(config.frame_period_ns),
            old_control: 0,
            irq_level: false,
            mem,
            stack,
            clock,
        };
        ctrl.reset();
        ctrl
    }

    pub fn config(&self) -> &OhciConfig {
        &self.config
    }

    pub fn hub(&self) -> &RootHub {
        &self.hub
    }

    pub fn stack(&self) -> &dyn UsbDeviceStack {
        &*self.stack
    }

    pub fn stack_mut(&mut self) -> &mut dyn UsbDeviceStack {
        &mut *self.stack
    }

    pub fn state(&self) -> HcState {
        self.regs.state()
    }

    pub fn frame_number(&self) -> u16 {
        self.regs.fm_number
    }

    pub fn irq_level(&self) -> bool {
        self.irq_level
    }

    /// Whether the frame timer is armed.
    pub fn bus_running(&self) -> bool {
        self.timer.is_armed()
    }

    /// Whether a general TD is waiting on the device stack.
    pub fn async_pending(&self) -> bool {
        self.transfers.async_td.is_some()
    }

    /// Interrupt delay counter of the Done Queue (7 means "no retired TD waiting").
    pub fn done_count(&self) -> u8 {
        self.transfers.done.delay
    }

    /// Full hardware reset: registers, root hub ports, in-flight transfers and the Done Queue.
    pub fn reset(&mut self) {
        self.bus_stop();
        self.regs = OhciRegs::new();
        self.old_control = 0;
        self.transfers.done = DoneQueue::new();

        self.hub.reset();
        for port in 0..self.hub.num_ports() {
            if let Some(dev) = self.stack.port_device(port) {
                self.stack.reset_port(port);
                // The device survives the port reset and is announced again.
                self.hub.attach(port, dev.speed);
            }
        }

        self.transfers.cancel_all(&mut *self.stack);
        self.stop_endpoints();
        self.update_irq();
        debug!("OHCI reset");
    }

    /// 32-bit MMIO read. Anything but an aligned dword access reads as all-ones.
    pub fn mmio_read(&self, offset: u64, size: usize) -> u32 {
        if size != 4 || offset % 4 != 0 {
            debug!(offset, size, "unaligned OHCI register read ignored");
            return u32::MAX;
        }
        self.read_register(offset)
    }

    /// 32-bit MMIO write. Anything but an aligned dword access is ignored.
    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u32) {
        if size != 4 || offset % 4 != 0 {
            debug!(offset, size, value, "unaligned OHCI register write ignored");
            return;
        }
        self.write_register(offset, value);
    }

    pub fn read_register(&self, offset: u64) -> u32 {
        match reg_info(offset).map(|info| info.kind) {
            Some(RegKind::PortStatus(port)) => return self.hub.read_port(port),
            None => {
                warn!(offset, "read from bad OHCI register offset");
                return u32::MAX;
            }
            Some(_) => {}
        }
        match offset {
            REG_HC_REVISION => OHCI_REVISION,
            REG_HC_CONTROL => self.regs.control,
            REG_HC_COMMAND_STATUS => self.regs.command_status,
            REG_HC_INTERRUPT_STATUS => self.regs.interrupt_status,
            REG_HC_INTERRUPT_ENABLE | REG_HC_INTERRUPT_DISABLE => self.regs.interrupt_enable,
            REG_HC_HCCA => self.regs.hcca,
            REG_HC_PERIOD_CURRENT_ED => self.regs.period_current_ed,
            REG_HC_CONTROL_HEAD_ED => self.regs.control_head_ed,
            REG_HC_CONTROL_CURRENT_ED => self.regs.control_current_ed,
            REG_HC_BULK_HEAD_ED => self.regs.bulk_head_ed,
            REG_HC_BULK_CURRENT_ED => self.regs.bulk_current_ed,
            REG_HC_DONE_HEAD => self.transfers.done.head,
            REG_HC_FM_INTERVAL => self.regs.fm_interval,
            REG_HC_FM_REMAINING => self.frame_remaining(),
            REG_HC_FM_NUMBER => u32::from(self.regs.fm_number),
            REG_HC_PERIODIC_START => self.regs.periodic_start,
            REG_HC_LS_THRESHOLD => self.regs.ls_threshold,
            REG_HC_RH_DESCRIPTOR_A => self.regs.rh_descriptor_a,
            REG_HC_RH_DESCRIPTOR_B => self.regs.rh_descriptor_b,
            REG_HC_RH_STATUS => self.hub.read_status(),
            _ => u32::MAX,
        }
    }

    pub fn write_register(&mut self, offset: u64, value: u32) {
        let Some(info) = reg_info(offset) else {
            warn!(offset, value, "write to bad OHCI register offset");
            return;
        };
        if value & !info.check_mask != 0 && info.kind != RegKind::ReadOnly {
            debug!(
                register = info.name,
                value,
                reserved = value & !info.check_mask,
                "write touches reserved bits"
            );
        }

        match info.kind {
            RegKind::ReadOnly | RegKind::Ignored => {
                trace!(register = info.name, value, "write ignored");
            }
            RegKind::Masked => {
                if offset == REG_HC_FM_INTERVAL
                    && (value ^ self.regs.fm_interval) & FMI_FIT != 0
                {
                    debug!(fi = value & FMI_FI_MASK, "HcFmInterval: frame interval toggled");
                }
                if let Some(slot) = self.regs.masked_slot(offset) {
                    *slot = (*slot & !info.write_mask) | (value & info.write_mask);
                }
            }
            RegKind::Control => self.change_state(value & info.write_mask),
            RegKind::CommandStatus => {
                // SOC is read-only; everything else written as 1 is latched.
                self.regs.command_status |= value & info.write_mask;
                if self.regs.command_status & CS_HCR != 0 {
                    debug!("HcCommandStatus: software reset");
                    self.reset();
                }
            }
            RegKind::InterruptStatus => {
                self.regs.interrupt_status &= !(value & info.w1c_mask);
                self.update_irq();
            }
            RegKind::InterruptEnable => {
                self.regs.interrupt_enable |= value & info.write_mask;
                self.update_irq();
            }
            RegKind::InterruptDisable => {
                self.regs.interrupt_enable &= !(value & info.w1c_mask);
                self.update_irq();
            }
            RegKind::RhStatus => {
                if self.hub.write_status(value) {
                    self.set_interrupt(INT_RHSC);
                }
            }
            RegKind::PortStatus(port) => {
                if self.hub.write_port(port, value, &mut *self.stack) {
                    self.set_interrupt(INT_RHSC);
                }
            }
        }
    }

    /// Applies a new `HcControl` value, running the functional-state transition if HCFS changed.
    fn change_state(&mut self, value: u32) {
        let old_state = self.regs.state();
        self.regs.control = value;
        let new_state = self.regs.state();

        if old_state == new_state {
            return;
        }

        match new_state {
            HcState::Operational => {
                debug!("OHCI operational");
                self.bus_start();
            }
            HcState::Suspend => {
                debug!("OHCI suspended");
                self.bus_stop();
            }
            HcState::Resume => debug!("OHCI resuming"),
            HcState::Reset => {
                debug!("OHCI reset via HcControl");
                self.reset();
            }
        }
    }

    fn bus_start(&mut self) {
        let now = self.clock.now_ns();
        self.timer.start(now);
        self.set_interrupt(INT_SF);
    }

    fn bus_stop(&mut self) {
        self.timer.stop();
    }

    fn frame_remaining(&self) -> u32 {
        let frt = self.regs.fm_remaining & FMR_FRT;
        if self.regs.state() != HcState::Operational {
            return frt;
        }
        match self.timer.bit_times_since_sof(self.clock.now_ns()) {
            Some(ticks) => {
                let fi = u64::from(self.regs.fm_interval & FMI_FI_MASK);
                frt | (fi.saturating_sub(ticks) as u32 & FMR_FR_MASK)
            }
            None => frt,
        }
    }

    fn set_interrupt(&mut self, bits: u32) {
        self.regs.interrupt_status |= bits;
        self.update_irq();
    }

    fn update_irq(&mut self) {
        let pending = self.regs.interrupt_status & self.regs.interrupt_enable & INT_STATUS_MASK;
        let level = self.regs.interrupt_enable & INT_MIE != 0 && pending != 0;
        if level != self.irq_level {
            trace!(level, "OHCI irq");
        }
        self.irq_level = level;
    }

    fn fatal_error(&mut self, fault: DescriptorFault) {
        warn!(%fault, "OHCI unrecoverable error");
        self.set_interrupt(INT_UE);
        self.bus_stop();
    }

    /// Notifies the device stack that every endpoint of every attached device stopped.
    fn stop_endpoints(&mut self) {
        for port in 0..self.hub.num_ports() {
            if let Some(dev) = self.stack.port_device(port) {
                self.stack.device_stopped(dev.id);
            }
        }
    }

    fn with_schedule<R>(&mut self, f: impl FnOnce(&mut ScheduleContext<'_>) -> R) -> R {
        let mut ctx = ScheduleContext {
            mem: &*self.mem,
            stack: &mut *self.stack,
            hub: &self.hub,
            transfers: &mut self.transfers,
            frame_number: self.regs.fm_number,
        };
        f(&mut ctx)
    }

    /// Runs every frame pass that is due according to the host clock. Returns how many ran.
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now_ns();
        let mut frames = 0;
        while let Some(boundary) = self.timer.due(now) {
            if frames == self.config.max_catch_up_frames {
                debug!(frames, "OHCI frame timer fell behind; dropping backlog");
                self.timer.resync(now);
                break;
            }
            self.frame_boundary(boundary);
            frames += 1;
        }
        frames
    }

    fn frame_boundary(&mut self, boundary_ns: u64) {
        if let Err(fault) = self.run_frame(boundary_ns) {
            self.fatal_error(fault);
        }
    }

    fn run_frame(&mut self, boundary_ns: u64) -> Result<(), DescriptorFault> {
        let hcca_addr = self.regs.hcca;
        let mut hcca = Hcca::read(&*self.mem, hcca_addr)?;
        trace!(frame = self.regs.fm_number, "OHCI frame");

        if self.regs.control & CTL_PLE != 0 {
            let index = usize::from(self.regs.fm_number & 0x1f);
            let head = hcca.interrupt_table[index] & DPTR_MASK;
            self.with_schedule(|ctx| service_ed_list(ctx, head, false))?;
        }

        // Cancel any pending packets if the list was just disabled.
        if self.old_control & !self.regs.control & (CTL_BLE | CTL_CLE) != 0 {
            self.transfers.cancel_async(&mut *self.stack);
            self.stop_endpoints();
        }
        self.old_control = self.regs.control;
        self.process_lists(false)?;

        if self.regs.interrupt_status & INT_UE != 0 {
            self.bus_stop();
            return Ok(());
        }

        // Frame Remaining Toggle follows Frame Interval Toggle at each frame boundary.
        self.regs.fm_remaining =
            (self.regs.fm_remaining & !FMR_FRT) | (self.regs.fm_interval & FMI_FIT);

        self.regs.fm_number = self.regs.fm_number.wrapping_add(1);
        hcca.frame_number = self.regs.fm_number;

        let done = &mut self.transfers.done;
        if done.delay == 0 && self.regs.interrupt_status & INT_WD == 0 {
            if done.head == 0 {
                warn!("done queue flush with empty HcDoneHead");
            }
            let mut head = done.head;
            if self.regs.interrupt_enable & self.regs.interrupt_status != 0 {
                head |= 1;
            }
            hcca.done_head = head;
            done.head = 0;
            done.delay = DoneQueue::INITIAL_DELAY;
            self.set_interrupt(INT_WD);
        } else if done.delay != 0 && done.delay != DoneQueue::INITIAL_DELAY {
            done.delay -= 1;
        }

        self.timer.start_of_frame(boundary_ns);
        self.set_interrupt(INT_SF);

        hcca.write_back(&*self.mem, hcca_addr)
    }

    /// Services the control and bulk lists.
    fn process_lists(&mut self, completion: bool) -> Result<(), DescriptorFault> {
        if self.regs.control & CTL_CLE != 0 && self.regs.command_status & CS_CLF != 0 {
            let head = self.regs.control_head_ed;
            let current = self.regs.control_current_ed;
            if current != 0 && current != head {
                debug!(head, current, "control list: current ED differs from head");
            }
            let active = self.with_schedule(|ctx| service_ed_list(ctx, head, completion))?;
            if !active {
                self.regs.control_current_ed = 0;
                self.regs.command_status &= !CS_CLF;
            }
        }

        if self.regs.control & CTL_BLE != 0 && self.regs.command_status & CS_BLF != 0 {
            let head = self.regs.bulk_head_ed;
            let current = self.regs.bulk_current_ed;
            if current != 0 && current != head {
                debug!(head, current, "bulk list: current ED differs from head");
            }
            let active = self.with_schedule(|ctx| service_ed_list(ctx, head, completion))?;
            if !active {
                self.regs.bulk_current_ed = 0;
                self.regs.command_status &= !CS_BLF;
            }
        }

        Ok(())
    }

    /// Delivers the final state of a packet that previously reported `Async`.
    ///
    /// A general TD completion re-runs the control and bulk lists in completion mode right away.
    /// Isochronous completions are picked up by the next frame pass.
    pub fn async_complete(&mut self, packet: UsbPacket) {
        let id = packet.id;
        if let Some(transfer) = self
            .transfers
            .async_td
            .as_mut()
            .filter(|transfer| transfer.packet == id)
        {
            debug!(td = transfer.td_addr, status = ?packet.status, "async packet complete");
            transfer.completed = Some(packet);
            if let Err(fault) = self.process_lists(true) {
                self.fatal_error(fault);
            }
            return;
        }

        if let Some(transfer) = self
            .transfers
            .iso
            .iter_mut()
            .find(|transfer| transfer.packet == id)
        {
            trace!(td = transfer.td_addr, "async isochronous packet complete");
            transfer.completed = Some(packet);
            return;
        }

        debug!(packet = id.0, "completion for unknown or cancelled packet");
    }

    /// Cancels in-flight transfers, general and isochronous, that target `device`.
    fn async_cancel_device(&mut self, device: DeviceId) {
        let matches = self.transfers.async_td.as_ref().is_some_and(|transfer| {
            transfer.device == device && self.stack.packet_inflight(transfer.packet)
        });
        if matches {
            self.transfers.cancel_async(&mut *self.stack);
        }
        self.transfers.cancel_iso_for_device(&mut *self.stack, device);
    }

    /// A device was connected to a root hub port.
    pub fn attach(&mut self, port: usize, speed: UsbSpeed) {
        debug!(port, ?speed, "OHCI port attach");
        let changed = self.hub.attach(port, speed);
        if self.regs.state() == HcState::Suspend {
            self.set_interrupt(INT_RD);
        }
        if changed {
            self.set_interrupt(INT_RHSC);
        }
    }

    /// The device on a root hub port was disconnected.
    pub fn detach(&mut self, port: usize, device: Option<DeviceId>) {
        debug!(port, "OHCI port detach");
        if let Some(device) = device {
            self.async_cancel_device(device);
        }
        if self.hub.detach(port) {
            self.set_interrupt(INT_RHSC);
        }
    }

    /// A device behind a downstream hub was disconnected.
    pub fn child_detach(&mut self, device: DeviceId) {
        self.async_cancel_device(device);
    }

    /// Remote wakeup signalled on `port`.
    pub fn wakeup(&mut self, port: usize) {
        let mut intr = 0;
        if self.hub.wakeup(port) {
            intr = INT_RHSC;
        }
        if self.regs.state() == HcState::Suspend {
            debug!(port, "OHCI remote wakeup: resuming");
            self.regs.control =
                (self.regs.control & !CTL_HCFS_MASK) | HcState::Resume.bits();
            intr = INT_RD;
        }
        if intr != 0 {
            self.set_interrupt(intr);
        }
    }
}
