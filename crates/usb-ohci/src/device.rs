//! Boundary between the host controller and the USB device-model stack.
//!
//! The controller consumes [`UsbDeviceStack`]: it looks devices up by function address, resolves
//! endpoints, submits [`UsbPacket`]s and cancels them. The device stack in turn reports topology
//! changes and asynchronous completions back through [`AttachObserver`] and [`PortOwner`], which
//! the shared controller handle implements.
//!
//! Calls from the controller into the stack are made while the controller lock is held. A stack
//! must therefore never invoke the observer traits synchronously from inside one of its
//! [`UsbDeviceStack`] methods; a packet that completes immediately reports its final status in
//! the packet instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
}

/// Token PID of a USB transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsbPid {
    Setup,
    Out,
    In,
}

impl UsbPid {
    /// Raw PID byte as it appears on the wire.
    pub const fn token(self) -> u8 {
        match self {
            UsbPid::Setup => 0x2d,
            UsbPid::Out => 0xe1,
            UsbPid::In => 0x69,
        }
    }
}

/// Opaque device handle handed out by the device stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Opaque endpoint handle handed out by the device stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u32);

/// Controller-assigned packet identifier, unique for the controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedDevice {
    pub id: DeviceId,
    pub speed: UsbSpeed,
}

/// Device-level result of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Not yet handed to a device.
    Setup,
    Success,
    Nak,
    Stall,
    Babble,
    IoError,
    NoDevice,
    /// Accepted by the device; completion is reported later via [`PortOwner::async_complete`].
    Async,
    /// Any other device-specific failure.
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPacket {
    pub id: PacketId,
    pub pid: UsbPid,
    pub device: DeviceId,
    pub endpoint: EndpointId,
    /// Guest address of the TD or IsoTD that produced this packet.
    pub td_addr: u32,
    pub short_not_ok: bool,
    pub int_req: bool,
    /// OUT/SETUP payload, or the IN receive buffer sized to the requested length.
    pub data: Vec<u8>,
    pub status: PacketStatus,
    /// Bytes transferred. For IN packets only the first `actual_length` bytes of `data` are valid.
    pub actual_length: usize,
}

impl UsbPacket {
    pub fn new(
        id: PacketId,
        pid: UsbPid,
        device: DeviceId,
        endpoint: EndpointId,
        td_addr: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            pid,
            device,
            endpoint,
            td_addr,
            short_not_ok: false,
            int_req: false,
            data,
            status: PacketStatus::Setup,
            actual_length: 0,
        }
    }
}

/// The USB device-model stack consumed by the controller.
pub trait UsbDeviceStack: Send {
    /// Device currently attached directly to root hub `port`, if any.
    fn port_device(&self, port: usize) -> Option<AttachedDevice>;

    /// Finds the device (or a device behind a hub) on `port` answering to function `address`.
    fn find_device(&mut self, port: usize, address: u8) -> Option<DeviceId>;

    fn endpoint(&mut self, device: DeviceId, pid: UsbPid, number: u8) -> Option<EndpointId>;

    /// Hands a packet to the device. On return `packet.status` holds the outcome, which may be
    /// [`PacketStatus::Async`] when the device completes it later.
    fn handle_packet(&mut self, packet: &mut UsbPacket);

    fn cancel_packet(&mut self, packet: PacketId);

    fn packet_inflight(&self, packet: PacketId) -> bool;

    fn endpoint_stopped(&mut self, device: DeviceId, endpoint: EndpointId);

    /// Every endpoint (control, IN and OUT) of `device` stopped.
    fn device_stopped(&mut self, device: DeviceId);

    fn reset_device(&mut self, device: DeviceId);

    fn reset_port(&mut self, port: usize);
}

/// Topology notifications delivered by the device stack.
pub trait AttachObserver {
    fn attach(&self, port: usize, speed: UsbSpeed);
    fn detach(&self, port: usize, device: Option<DeviceId>);
    /// A device behind a downstream hub went away.
    fn child_detach(&self, device: DeviceId);
}

/// Port-owner callbacks delivered by the device stack.
pub trait PortOwner {
    /// Remote wakeup signalled on `port`.
    fn wakeup(&self, port: usize);
    /// An asynchronous packet finished. `packet.status` must no longer be `Async`.
    fn async_complete(&self, packet: UsbPacket);
}
