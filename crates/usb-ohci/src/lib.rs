//! OHCI USB host controller emulation.
//!
//! - [`ohci`]: the controller model (registers, frame scheduler, descriptor processing, root hub).
//! - [`device`]: the interface to the USB device-model stack.
//! - [`memory`]: guest-physical memory access used for all descriptor and buffer DMA.
//! - [`clock`]: guest time sources driving the frame timer.
//! - [`shared`]: the lock-protected controller handle and its background frame worker.

pub mod clock;
pub mod device;
pub mod memory;
pub mod ohci;
pub mod shared;

pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use device::{
    AttachObserver, AttachedDevice, DeviceId, EndpointId, PacketId, PacketStatus, PortOwner,
    UsbDeviceStack, UsbPacket, UsbPid, UsbSpeed,
};
pub use memory::{GuestMemory, GuestMemoryError, VecGuestMemory};
pub use ohci::{OhciConfig, OhciController};
pub use shared::{FrameWorker, SharedOhci};
