//! OHCI root hub: `HcRhStatus` and the per-port `HcRhPortStatus` state machines.
//!
//! Ports keep their raw status word. Guest writes use the write-side meaning of each bit
//! (e.g. writing CCS means "clear port enable"), and every change bit is write-1-to-clear.

use tracing::debug;

use super::regs::*;
use crate::device::{UsbDeviceStack, UsbSpeed};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootPort {
    status: u32,
}

impl RootPort {
    /// Guest-visible status. Port power cannot be removed on this hardware.
    pub fn read(&self) -> u32 {
        self.status | PORT_PPS
    }

    pub fn raw_status(&self) -> u32 {
        self.status
    }

    pub fn connected(&self) -> bool {
        self.status & PORT_CCS != 0
    }

    pub fn enabled(&self) -> bool {
        self.status & PORT_PES != 0
    }

    pub fn suspended(&self) -> bool {
        self.status & PORT_PSS != 0
    }

    fn set_power(&mut self, on: bool) {
        if on {
            self.status |= PORT_PPS;
        } else {
            self.status &= !(PORT_PPS | PORT_CCS | PORT_PSS | PORT_PRS);
        }
    }

    /// Sets `bit` only if a device is connected. Writing to a disconnected port latches CSC so the
    /// driver rechecks the connection. Returns whether `bit` went from 0 to 1.
    fn set_if_connected(&mut self, value: u32, bit: u32) -> bool {
        if value & bit == 0 {
            return false;
        }
        if !self.connected() {
            self.status |= PORT_CSC;
            return false;
        }
        if self.status & bit != 0 {
            return false;
        }
        self.status |= bit;
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct RootHub {
    ports: [RootPort; NUM_PORTS],
    status: u32,
}

impl RootHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, port: usize) -> Option<&RootPort> {
        self.ports.get(port)
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn read_status(&self) -> u32 {
        self.status
    }

    pub fn read_port(&self, port: usize) -> u32 {
        self.ports.get(port).map_or(0, RootPort::read)
    }

    /// Clears hub and port state.
    pub fn reset(&mut self) {
        self.status = 0;
        for port in self.ports.iter_mut() {
            port.status = 0;
        }
    }

    /// Ports that are enabled, in port order.
    pub fn enabled_ports(&self) -> impl Iterator<Item = usize> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.enabled())
            .map(|(i, _)| i)
    }

    /// Applies a guest write to `HcRhStatus`. Returns whether the hub status changed.
    pub fn write_status(&mut self, value: u32) -> bool {
        let old = self.status;

        // write 1 to clear OCIC
        if value & RHS_OCIC != 0 {
            self.status &= !RHS_OCIC;
        }

        if value & RHS_LPS != 0 {
            for port in self.ports.iter_mut() {
                port.set_power(false);
            }
            debug!("root hub: global power off");
        }

        if value & RHS_LPSC != 0 {
            for port in self.ports.iter_mut() {
                port.set_power(true);
            }
            debug!("root hub: global power on");
        }

        if value & RHS_DRWE != 0 {
            self.status |= RHS_DRWE;
        }

        if value & RHS_CRWE != 0 {
            self.status &= !RHS_DRWE;
        }

        old != self.status
    }

    /// Applies a guest write to `HcRhPortStatus[port]`. Returns whether the port status changed.
    pub fn write_port(&mut self, port: usize, value: u32, stack: &mut dyn UsbDeviceStack) -> bool {
        let Some(p) = self.ports.get_mut(port) else {
            return false;
        };
        let old = p.status;

        p.status &= !(value & PORT_W1C_MASK);

        if value & PORT_CCS != 0 {
            p.status &= !PORT_PES;
        }

        p.set_if_connected(value, PORT_PES);

        if p.set_if_connected(value, PORT_PSS) {
            debug!(port, "root hub port suspended");
        }

        if p.set_if_connected(value, PORT_PRS) {
            debug!(port, "root hub port reset");
            if let Some(dev) = stack.port_device(port) {
                stack.reset_device(dev.id);
            }
            p.status &= !PORT_PRS;
            // reset done, enable port
            p.status |= PORT_PES | PORT_PRSC;
        }

        // Clear Port Power / Set Port Power
        if value & PORT_LSDA != 0 {
            p.set_power(false);
        }
        if value & PORT_PPS != 0 {
            p.set_power(true);
        }

        old != p.status
    }

    /// A device appeared on `port`. Returns whether the port status changed.
    pub fn attach(&mut self, port: usize, speed: UsbSpeed) -> bool {
        let Some(p) = self.ports.get_mut(port) else {
            return false;
        };
        let old = p.status;
        p.status |= PORT_CCS | PORT_CSC;
        match speed {
            UsbSpeed::Low => p.status |= PORT_LSDA,
            UsbSpeed::Full => p.status &= !PORT_LSDA,
        }
        old != p.status
    }

    /// The device on `port` went away. Returns whether the port status changed.
    pub fn detach(&mut self, port: usize) -> bool {
        let Some(p) = self.ports.get_mut(port) else {
            return false;
        };
        let old = p.status;
        if p.status & PORT_CCS != 0 {
            p.status &= !PORT_CCS;
            p.status |= PORT_CSC;
        }
        if p.status & PORT_PES != 0 {
            p.status &= !PORT_PES;
            p.status |= PORT_PESC;
        }
        old != p.status
    }

    /// Remote wakeup on `port`. Returns whether the port left suspend.
    pub fn wakeup(&mut self, port: usize) -> bool {
        let Some(p) = self.ports.get_mut(port) else {
            return false;
        };
        if p.status & PORT_PSS == 0 {
            return false;
        }
        p.status |= PORT_PSSC;
        p.status &= !PORT_PSS;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        AttachedDevice, DeviceId, EndpointId, PacketId, UsbPacket, UsbPid,
    };

    #[derive(Default)]
    struct ResetRecorder {
        attached: Option<AttachedDevice>,
        resets: Vec<DeviceId>,
    }

    impl UsbDeviceStack for ResetRecorder {
        fn port_device(&self, _port: usize) -> Option<AttachedDevice> {
            self.attached
        }
        fn find_device(&mut self, _port: usize, _address: u8) -> Option<DeviceId> {
            None
        }
        fn endpoint(&mut self, _device: DeviceId, _pid: UsbPid, _number: u8) -> Option<EndpointId> {
            None
        }
        fn handle_packet(&mut self, _packet: &mut UsbPacket) {}
        fn cancel_packet(&mut self, _packet: PacketId) {}
        fn packet_inflight(&self, _packet: PacketId) -> bool {
            false
        }
        fn endpoint_stopped(&mut self, _device: DeviceId, _endpoint: EndpointId) {}
        fn device_stopped(&mut self, _device: DeviceId) {}
        fn reset_device(&mut self, device: DeviceId) {
            self.resets.push(device);
        }
        fn reset_port(&mut self, _port: usize) {}
    }

    #[test]
    fn attach_sets_connect_change_and_speed() {
        let mut hub = RootHub::new();
        assert!(hub.attach(1, UsbSpeed::Low));
        assert_eq!(hub.read_port(1), PORT_CCS | PORT_CSC | PORT_LSDA | PORT_PPS);
        assert!(!hub.attach(1, UsbSpeed::Low));
        assert!(hub.attach(1, UsbSpeed::Full));
        assert_eq!(hub.read_port(1) & PORT_LSDA, 0);
    }

    #[test]
    fn enable_on_disconnected_port_only_latches_csc() {
        let mut hub = RootHub::new();
        let mut stack = ResetRecorder::default();
        assert!(hub.write_port(0, PORT_PES, &mut stack));
        assert_eq!(hub.port(0).unwrap().raw_status(), PORT_CSC);
    }

    #[test]
    fn reset_write_resets_device_and_enables_port() {
        let mut hub = RootHub::new();
        let mut stack = ResetRecorder {
            attached: Some(AttachedDevice {
                id: DeviceId(7),
                speed: UsbSpeed::Full,
            }),
            resets: Vec::new(),
        };
        hub.attach(0, UsbSpeed::Full);
        hub.write_port(0, PORT_CSC, &mut stack);

        assert!(hub.write_port(0, PORT_PRS, &mut stack));
        assert_eq!(stack.resets, vec![DeviceId(7)]);
        assert_eq!(
            hub.port(0).unwrap().raw_status(),
            PORT_CCS | PORT_PES | PORT_PRSC
        );
    }

    #[test]
    fn clear_enable_and_power_down() {
        let mut hub = RootHub::new();
        let mut stack = ResetRecorder::default();
        hub.attach(2, UsbSpeed::Full);
        hub.write_port(2, PORT_PES | PORT_PSS, &mut stack);
        assert!(hub.port(2).unwrap().enabled());
        assert!(hub.port(2).unwrap().suspended());

        hub.write_port(2, PORT_CCS, &mut stack);
        assert!(!hub.port(2).unwrap().enabled());

        hub.write_port(2, PORT_LSDA, &mut stack);
        let status = hub.port(2).unwrap().raw_status();
        assert_eq!(status & (PORT_CCS | PORT_PSS | PORT_PRS | PORT_PPS), 0);
        // Power is always reported.
        assert_ne!(hub.read_port(2) & PORT_PPS, 0);
    }

    #[test]
    fn hub_status_global_power_and_remote_wakeup() {
        let mut hub = RootHub::new();
        hub.attach(0, UsbSpeed::Full);
        assert!(!hub.write_status(RHS_LPSC));
        assert_ne!(hub.port(0).unwrap().raw_status() & PORT_PPS, 0);

        assert!(hub.write_status(RHS_DRWE));
        assert_eq!(hub.read_status(), RHS_DRWE);
        assert!(hub.write_status(RHS_CRWE));
        assert_eq!(hub.read_status(), 0);

        hub.write_status(RHS_LPS);
        assert!(!hub.port(0).unwrap().connected());
    }

    #[test]
    fn detach_and_wakeup() {
        let mut hub = RootHub::new();
        let mut stack = ResetRecorder::default();
        hub.attach(3, UsbSpeed::Full);
        hub.write_port(3, PORT_PES | PORT_PSS | PORT_CSC, &mut stack);
        assert!(hub.wakeup(3));
        assert!(!hub.wakeup(3));
        assert_ne!(hub.port(3).unwrap().raw_status() & PORT_PSSC, 0);

        assert!(hub.detach(3));
        let status = hub.port(3).unwrap().raw_status();
        assert_eq!(status & (PORT_CCS | PORT_PES), 0);
        assert_eq!(status & (PORT_CSC | PORT_PESC), PORT_CSC | PORT_PESC);
    }
}
