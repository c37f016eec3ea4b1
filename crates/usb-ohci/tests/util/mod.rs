#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use usb_ohci::ohci::descriptor::{
    DIR_IN, DIR_OUT, ED_D_SHIFT, ED_EN_SHIFT, ED_MPS_SHIFT, TD_CC_SHIFT, TD_DI_SHIFT, TD_DP_SHIFT,
};
use usb_ohci::ohci::regs::*;
use usb_ohci::ohci::{OhciConfig, OhciController, FRAME_PERIOD_NS};
use usb_ohci::{
    AttachedDevice, DeviceId, EndpointId, FakeHostClock, GuestMemory, PacketId, PacketStatus,
    UsbDeviceStack, UsbPacket, UsbPid, UsbSpeed, VecGuestMemory,
};

pub const MEM_SIZE: usize = 0x10_0000;

pub const HCCA_ADDR: u32 = 0x1000;
pub const ED_BASE: u32 = 0x2000;
pub const TD_BASE: u32 = 0x3000;
pub const BUF_BASE: u32 = 0x8000;

/// Condition code drivers put in freshly queued TDs.
pub const CC_NOT_ACCESSED: u32 = 0xf;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// What the scripted device does with the next packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Accept all OUT/SETUP data, or answer IN with a zero-length packet.
    Ack,
    /// Answer IN with these bytes (the reported length may exceed the buffer).
    Data(Vec<u8>),
    /// Accept only this many OUT bytes.
    Partial(usize),
    Nak,
    Stall,
    Status(PacketStatus),
    Async,
}

#[derive(Debug, Clone, Copy)]
pub struct TestDevice {
    pub id: DeviceId,
    pub speed: UsbSpeed,
    pub address: u8,
}

#[derive(Debug, Default)]
pub struct StackState {
    pub ports: [Option<TestDevice>; NUM_PORTS],
    pub responses: VecDeque<Response>,
    pub submitted: Vec<UsbPacket>,
    pub inflight: Vec<UsbPacket>,
    pub cancelled: Vec<PacketId>,
    pub stopped_endpoints: Vec<(DeviceId, EndpointId)>,
    pub stopped_devices: Vec<DeviceId>,
    pub device_resets: Vec<DeviceId>,
    pub port_resets: Vec<usize>,
}

/// Device stack answering packets from a scripted queue. With an empty queue every packet NAKs.
#[derive(Clone, Default)]
pub struct TestStack {
    state: Arc<Mutex<StackState>>,
}

impl TestStack {
    pub fn state(&self) -> MutexGuard<'_, StackState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_response(&self, response: Response) {
        self.state().responses.push_back(response);
    }

    pub fn submitted(&self) -> Vec<UsbPacket> {
        self.state().submitted.clone()
    }

    /// Removes the oldest in-flight packet, filling it in as `response` would have.
    pub fn finish_inflight(&self, response: Response) -> UsbPacket {
        let mut packet = self.state().inflight.remove(0);
        apply_response(&mut packet, &response);
        packet
    }
}

fn apply_response(packet: &mut UsbPacket, response: &Response) {
    match response {
        Response::Ack => {
            packet.status = PacketStatus::Success;
            packet.actual_length = if packet.pid == UsbPid::In {
                0
            } else {
                packet.data.len()
            };
        }
        Response::Data(bytes) => {
            let n = bytes.len().min(packet.data.len());
            packet.data[..n].copy_from_slice(&bytes[..n]);
            packet.status = PacketStatus::Success;
            packet.actual_length = bytes.len();
        }
        Response::Partial(n) => {
            packet.status = PacketStatus::Success;
            packet.actual_length = *n;
        }
        Response::Nak => packet.status = PacketStatus::Nak,
        Response::Stall => packet.status = PacketStatus::Stall,
        Response::Status(status) => packet.status = *status,
        Response::Async => packet.status = PacketStatus::Async,
    }
}

impl UsbDeviceStack for TestStack {
    fn port_device(&self, port: usize) -> Option<AttachedDevice> {
        self.state().ports.get(port).copied().flatten().map(|dev| AttachedDevice {
            id: dev.id,
            speed: dev.speed,
        })
    }

    fn find_device(&mut self, port: usize, address: u8) -> Option<DeviceId> {
        self.state()
            .ports
            .get(port)
            .copied()
            .flatten()
            .filter(|dev| dev.address == address)
            .map(|dev| dev.id)
    }

    fn endpoint(&mut self, device: DeviceId, pid: UsbPid, number: u8) -> Option<EndpointId> {
        let dir = match pid {
            UsbPid::In => 0x80,
            UsbPid::Out | UsbPid::Setup => 0,
        };
        Some(EndpointId((device.0 << 8) | dir | u32::from(number)))
    }

    fn handle_packet(&mut self, packet: &mut UsbPacket) {
        let mut state = self.state();
        let response = state.responses.pop_front().unwrap_or(Response::Nak);
        apply_response(packet, &response);
        state.submitted.push(packet.clone());
        if packet.status == PacketStatus::Async {
            state.inflight.push(packet.clone());
        }
    }

    fn cancel_packet(&mut self, packet: PacketId) {
        let mut state = self.state();
        state.inflight.retain(|p| p.id != packet);
        state.cancelled.push(packet);
    }

    fn packet_inflight(&self, packet: PacketId) -> bool {
        self.state().inflight.iter().any(|p| p.id == packet)
    }

    fn endpoint_stopped(&mut self, device: DeviceId, endpoint: EndpointId) {
        self.state().stopped_endpoints.push((device, endpoint));
    }

    fn device_stopped(&mut self, device: DeviceId) {
        self.state().stopped_devices.push(device);
    }

    fn reset_device(&mut self, device: DeviceId) {
        self.state().device_resets.push(device);
    }

    fn reset_port(&mut self, port: usize) {
        self.state().port_resets.push(port);
    }
}

pub struct Harness {
    pub ohci: OhciController,
    pub mem: Arc<VecGuestMemory>,
    pub clock: Arc<FakeHostClock>,
    pub stack: TestStack,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OhciConfig::default())
    }

    pub fn with_config(config: OhciConfig) -> Self {
        let mem = Arc::new(VecGuestMemory::new(MEM_SIZE));
        let clock = Arc::new(FakeHostClock::new(0));
        let stack = TestStack::default();
        let ohci = OhciController::new(
            config,
            mem.clone(),
            Box::new(stack.clone()),
            clock.clone(),
        );
        Self {
            ohci,
            mem,
            clock,
            stack,
        }
    }

    pub fn read(&self, offset: u64) -> u32 {
        self.ohci.mmio_read(offset, 4)
    }

    pub fn write(&mut self, offset: u64, value: u32) {
        self.ohci.mmio_write(offset, 4, value);
    }

    /// Plugs a device into `port` and resets the port so it is enabled, leaving change bits
    /// cleared.
    pub fn plug(&mut self, port: usize, address: u8) -> DeviceId {
        let id = DeviceId(port as u32 + 1);
        self.stack.state().ports[port] = Some(TestDevice {
            id,
            speed: UsbSpeed::Full,
            address,
        });
        self.ohci.attach(port, UsbSpeed::Full);
        self.write(reg_port_status(port), PORT_PRS);
        self.write(reg_port_status(port), PORT_W1C_MASK);
        id
    }

    /// Points the controller at the HCCA and enters Operational with the given list enables.
    pub fn start(&mut self, enables: u32) {
        self.write(REG_HC_HCCA, HCCA_ADDR);
        self.write(REG_HC_CONTROL, HcState::Operational.bits() | enables);
    }

    /// Advances guest time by one frame and runs the due frame pass.
    pub fn run_frame(&mut self) -> usize {
        self.clock.advance_ns(FRAME_PERIOD_NS);
        self.ohci.poll()
    }

    pub fn run_frames(&mut self, n: usize) {
        for _ in 0..n {
            self.run_frame();
        }
    }

    pub fn clear_interrupts(&mut self) {
        self.write(REG_HC_INTERRUPT_STATUS, u32::MAX);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read(REG_HC_INTERRUPT_STATUS)
    }

    /// Queues the control list starting at `head` and marks it filled.
    pub fn queue_control(&mut self, head: u32) {
        self.write(REG_HC_CONTROL_HEAD_ED, head);
        self.write(REG_HC_COMMAND_STATUS, CS_CLF);
    }

    pub fn queue_bulk(&mut self, head: u32) {
        self.write(REG_HC_BULK_HEAD_ED, head);
        self.write(REG_HC_COMMAND_STATUS, CS_BLF);
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        read_u32(&*self.mem, addr)
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        write_u32(&*self.mem, addr, value);
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read(u64::from(addr), &mut buf).unwrap();
        buf
    }

    pub fn write_bytes(&self, addr: u32, bytes: &[u8]) {
        self.mem.write(u64::from(addr), bytes).unwrap();
    }

    pub fn hcca_frame_number(&self) -> u16 {
        (self.read_u32(HCCA_ADDR + 0x80) & 0xffff) as u16
    }

    pub fn hcca_done_head(&self) -> u32 {
        self.read_u32(HCCA_ADDR + 0x84)
    }

    pub fn set_interrupt_table(&self, ed: u32) {
        for i in 0..32 {
            self.write_u32(HCCA_ADDR + i * 4, ed);
        }
    }
}

pub fn read_u32(mem: &dyn GuestMemory, addr: u32) -> u32 {
    let mut buf = [0u8; 4];
    mem.read(u64::from(addr), &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

pub fn write_u32(mem: &dyn GuestMemory, addr: u32, value: u32) {
    mem.write(u64::from(addr), &value.to_le_bytes()).unwrap();
}

pub fn ed_flags(address: u8, endpoint: u8, dir: u32, mps: u32) -> u32 {
    u32::from(address)
        | (u32::from(endpoint) << ED_EN_SHIFT)
        | (dir << ED_D_SHIFT)
        | (mps << ED_MPS_SHIFT)
}

pub fn td_flags(dp: u32, di: u32) -> u32 {
    (dp << TD_DP_SHIFT) | (di << TD_DI_SHIFT) | (CC_NOT_ACCESSED << TD_CC_SHIFT)
}

pub fn write_ed(h: &Harness, addr: u32, flags: u32, tail: u32, head: u32, next: u32) {
    for (i, word) in [flags, tail, head, next].into_iter().enumerate() {
        h.write_u32(addr + i as u32 * 4, word);
    }
}

pub fn write_td(h: &Harness, addr: u32, flags: u32, cbp: u32, next: u32, be: u32) {
    for (i, word) in [flags, cbp, next, be].into_iter().enumerate() {
        h.write_u32(addr + i as u32 * 4, word);
    }
}

/// Reads a general TD as `[flags, cbp, next, be]`.
pub fn read_td(h: &Harness, addr: u32) -> [u32; 4] {
    [
        h.read_u32(addr),
        h.read_u32(addr + 4),
        h.read_u32(addr + 8),
        h.read_u32(addr + 12),
    ]
}

pub fn td_cc(flags: u32) -> u32 {
    flags >> TD_CC_SHIFT
}

/// Writes an isochronous TD with `offsets` (unused entries zero).
pub fn write_iso_td(
    h: &Harness,
    addr: u32,
    flags: u32,
    bp0: u32,
    next: u32,
    be: u32,
    offsets: &[u16],
) {
    write_td(h, addr, flags, bp0, next, be);
    let mut raw = [0u8; 16];
    for (i, off) in offsets.iter().enumerate() {
        raw[i * 2..i * 2 + 2].copy_from_slice(&off.to_le_bytes());
    }
    h.write_bytes(addr + 16, &raw);
}

pub fn read_iso_offset(h: &Harness, addr: u32, index: u32) -> u16 {
    let raw = h.read_bytes(addr + 16 + index * 2, 2);
    u16::from_le_bytes([raw[0], raw[1]])
}

pub const OUT: u32 = DIR_OUT;
pub const IN: u32 = DIR_IN;

/// Dummy TD terminating the ED built by [`queue_single_td`].
pub const TAIL_TD: u32 = TD_BASE + 0x100;

/// Builds a control ED for device address 1, endpoint 0, holding one general TD of `len` bytes
/// at [`BUF_BASE`], and marks the control list filled.
pub fn queue_single_td(h: &mut Harness, dp: u32, di: u32, len: u32) {
    write_td(h, TD_BASE, td_flags(dp, di), BUF_BASE, TAIL_TD, BUF_BASE + len - 1);
    write_ed(h, ED_BASE, ed_flags(1, 0, 0, 64), TAIL_TD, TD_BASE, 0);
    h.queue_control(ED_BASE);
}

pub fn ed_head(h: &Harness, ed: u32) -> u32 {
    h.read_u32(ed + 8)
}
