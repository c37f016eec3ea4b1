//! Endpoint/transfer descriptor list processing for control, bulk and interrupt endpoints.
//!
//! The walkers here operate on borrowed pieces of the controller through [`ScheduleContext`]. Any
//! guest memory failure is returned as a [`DescriptorFault`]; the caller turns it into an
//! Unrecoverable Error.

use tracing::{debug, trace, warn};

use super::descriptor::{ConditionCode, DescriptorFault, Ed, Td, DIR_IN, DIR_OUT, DIR_SETUP};
use super::hub::RootHub;
use super::iso;
use crate::device::{
    DeviceId, EndpointId, PacketId, PacketStatus, UsbDeviceStack, UsbPacket, UsbPid,
};
use crate::memory::{read_phys, write_phys, GuestMemory};

/// Maximum number of EDs walked per list per pass.
///
/// ED lists live in guest memory and can contain cycles. The walk stops (without faulting) once
/// this many EDs have been visited.
pub(crate) const MAX_EDS_PER_LIST: usize = 4096;

/// Maximum number of TDs serviced for a single ED per pass.
pub(crate) const MAX_TDS_PER_ED: usize = 1024;

const PAGE_MASK: u32 = !0xfff;
const OFFSET_MASK: u32 = 0xfff;

/// Outcome of servicing one TD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TdProgress {
    /// The TD was consumed or advanced; keep servicing this ED.
    Continue,
    /// No further progress on this ED this pass (NAK, async pending, error, malformed TD).
    Stop,
}

/// Retired descriptors waiting to be written to the HCCA, and the interrupt delay counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DoneQueue {
    pub head: u32,
    pub delay: u8,
}

impl DoneQueue {
    pub const INITIAL_DELAY: u8 = 7;

    pub fn new() -> Self {
        Self {
            head: 0,
            delay: Self::INITIAL_DELAY,
        }
    }

    /// Prepends `addr` to the queue. `next_td` is the retired descriptor's link field.
    pub fn push(&mut self, addr: u32, next_td: &mut u32, delay_interrupt: u8) {
        *next_td = self.head;
        self.head = addr;
        self.delay = self.delay.min(delay_interrupt);
    }

    pub fn flush_now(&mut self) {
        self.delay = 0;
    }
}

impl Default for DoneQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The single general-TD transfer allowed to be outstanding in the device stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AsyncTransfer {
    pub td_addr: u32,
    pub packet: PacketId,
    pub device: DeviceId,
    pub endpoint: EndpointId,
    pub completed: Option<UsbPacket>,
}

/// An isochronous packet the device stack completes later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IsoTransfer {
    pub td_addr: u32,
    pub relative_frame: u16,
    pub packet: PacketId,
    pub device: DeviceId,
    pub endpoint: EndpointId,
    pub completed: Option<UsbPacket>,
}

/// Transfer bookkeeping shared by the TD and IsoTD processors.
#[derive(Debug, Default)]
pub(crate) struct TransferState {
    pub done: DoneQueue,
    pub async_td: Option<AsyncTransfer>,
    pub iso: Vec<IsoTransfer>,
    next_packet_id: u64,
}

impl TransferState {
    pub fn alloc_packet_id(&mut self) -> PacketId {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        PacketId(self.next_packet_id)
    }

    /// Cancels the in-flight general transfer, if any.
    pub fn cancel_async(&mut self, stack: &mut dyn UsbDeviceStack) {
        if let Some(transfer) = self.async_td.take() {
            debug!(td = transfer.td_addr, "cancelling in-flight transfer");
            stack.cancel_packet(transfer.packet);
        }
    }

    /// Cancels every in-flight transfer, general and isochronous.
    pub fn cancel_all(&mut self, stack: &mut dyn UsbDeviceStack) {
        self.cancel_async(stack);
        for transfer in self.iso.drain(..) {
            if transfer.completed.is_none() {
                stack.cancel_packet(transfer.packet);
            }
        }
    }

    /// Cancels pending isochronous packets addressed to `device`. Their IsoTDs are serviced
    /// again on the next pass.
    pub fn cancel_iso_for_device(&mut self, stack: &mut dyn UsbDeviceStack, device: DeviceId) {
        self.iso.retain(|transfer| {
            if transfer.device != device || transfer.completed.is_some() {
                return true;
            }
            debug!(td = transfer.td_addr, "cancelling isochronous packet");
            stack.cancel_packet(transfer.packet);
            false
        });
    }

    /// Cancels transfers whose TD is the head of a halted or skipped ED.
    fn cancel_for_td(&mut self, stack: &mut dyn UsbDeviceStack, td_addr: u32) {
        if self
            .async_td
            .as_ref()
            .is_some_and(|transfer| transfer.td_addr == td_addr)
        {
            if let Some(transfer) = self.async_td.take() {
                stack.cancel_packet(transfer.packet);
                stack.endpoint_stopped(transfer.device, transfer.endpoint);
            }
        }
        self.iso.retain(|transfer| {
            if transfer.td_addr != td_addr {
                return true;
            }
            if transfer.completed.is_none() {
                stack.cancel_packet(transfer.packet);
            }
            stack.endpoint_stopped(transfer.device, transfer.endpoint);
            false
        });
    }
}

pub(crate) struct ScheduleContext<'a> {
    pub mem: &'a dyn GuestMemory,
    pub stack: &'a mut dyn UsbDeviceStack,
    pub hub: &'a RootHub,
    pub transfers: &'a mut TransferState,
    pub frame_number: u16,
}

/// Final state of a packet handed to the device stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PacketResult {
    pub status: PacketStatus,
    pub actual_length: usize,
    pub data: Vec<u8>,
}

impl PacketResult {
    fn failed(status: PacketStatus) -> Self {
        Self {
            status,
            actual_length: 0,
            data: Vec::new(),
        }
    }

    /// Bytes transferred on success, or the failing status.
    pub fn transferred(&self) -> Result<usize, PacketStatus> {
        match self.status {
            PacketStatus::Success => Ok(self.actual_length),
            status => Err(status),
        }
    }
}

impl From<UsbPacket> for PacketResult {
    fn from(packet: UsbPacket) -> Self {
        Self {
            status: packet.status,
            actual_length: packet.actual_length,
            data: packet.data,
        }
    }
}

pub(crate) enum Dispatch {
    Done(PacketResult),
    Async {
        packet: PacketId,
        device: DeviceId,
        endpoint: EndpointId,
    },
}

pub(crate) struct PacketRequest {
    pub pid: UsbPid,
    pub address: u8,
    pub endpoint: u8,
    pub td_addr: u32,
    pub short_not_ok: bool,
    pub int_req: bool,
    pub data: Vec<u8>,
}

impl ScheduleContext<'_> {
    /// Finds the device answering to `address` behind any enabled root port.
    fn find_device(&mut self, address: u8) -> Option<DeviceId> {
        for port in self.hub.enabled_ports() {
            if let Some(device) = self.stack.find_device(port, address) {
                return Some(device);
            }
        }
        None
    }

    pub(crate) fn dispatch(&mut self, request: PacketRequest) -> Dispatch {
        let Some(device) = self.find_device(request.address) else {
            trace!(address = request.address, "no device at address");
            return Dispatch::Done(PacketResult::failed(PacketStatus::NoDevice));
        };
        let Some(endpoint) = self.stack.endpoint(device, request.pid, request.endpoint) else {
            debug!(
                address = request.address,
                endpoint = request.endpoint,
                "no such endpoint"
            );
            return Dispatch::Done(PacketResult::failed(PacketStatus::Stall));
        };

        let id = self.transfers.alloc_packet_id();
        let mut packet = UsbPacket::new(
            id,
            request.pid,
            device,
            endpoint,
            request.td_addr,
            request.data,
        );
        packet.short_not_ok = request.short_not_ok;
        packet.int_req = request.int_req;

        trace!(
            td = request.td_addr,
            pid = request.pid.token(),
            address = request.address,
            endpoint = request.endpoint,
            len = packet.data.len(),
            "dispatching packet"
        );
        self.stack.handle_packet(&mut packet);

        if packet.status == PacketStatus::Async {
            return Dispatch::Async {
                packet: id,
                device,
                endpoint,
            };
        }
        Dispatch::Done(packet.into())
    }
}

/// Length of a TD buffer running from `start` to `end` inclusive, where the buffer may cross one
/// 4K page boundary.
pub(crate) fn buffer_length(start: u32, end: u32) -> usize {
    if (start & PAGE_MASK) != (end & PAGE_MASK) {
        ((end & OFFSET_MASK) + 0x1001 - (start & OFFSET_MASK)) as usize
    } else {
        end.checked_sub(start).map_or(0, |len| len as usize + 1)
    }
}

/// Guest address ranges covered by `len` bytes starting at `start`, continuing on the page of
/// `end` once the first page is exhausted.
fn buffer_segments(start: u32, end: u32, len: usize) -> [(u32, usize); 2] {
    let first = (0x1000 - (start & OFFSET_MASK) as usize).min(len);
    [(start, first), (end & PAGE_MASK, len - first)]
}

pub(crate) fn copy_from_guest(
    mem: &dyn GuestMemory,
    start: u32,
    end: u32,
    len: usize,
) -> Result<Vec<u8>, DescriptorFault> {
    let mut buf = vec![0u8; len];
    let mut pos = 0;
    for (addr, n) in buffer_segments(start, end, len) {
        if n == 0 {
            continue;
        }
        read_phys(mem, u64::from(addr), &mut buf[pos..pos + n])
            .map_err(|source| DescriptorFault::Buffer { addr, source })?;
        pos += n;
    }
    Ok(buf)
}

pub(crate) fn copy_to_guest(
    mem: &dyn GuestMemory,
    start: u32,
    end: u32,
    data: &[u8],
) -> Result<(), DescriptorFault> {
    let mut pos = 0;
    for (addr, n) in buffer_segments(start, end, data.len()) {
        if n == 0 {
            continue;
        }
        write_phys(mem, u64::from(addr), &data[pos..pos + n])
            .map_err(|source| DescriptorFault::Buffer { addr, source })?;
        pos += n;
    }
    Ok(())
}

fn pid_for_direction(dir: u32) -> Option<UsbPid> {
    match dir {
        DIR_SETUP => Some(UsbPid::Setup),
        DIR_OUT => Some(UsbPid::Out),
        DIR_IN => Some(UsbPid::In),
        _ => None,
    }
}

/// Walks the ED list starting at `head`. Returns whether any ED still had TDs queued.
pub(crate) fn service_ed_list(
    ctx: &mut ScheduleContext<'_>,
    head: u32,
    completion: bool,
) -> Result<bool, DescriptorFault> {
    let mut active = false;
    let mut cur = head;
    let mut visited = 0usize;

    while cur != 0 {
        if visited == MAX_EDS_PER_LIST {
            warn!(head, "ED list exceeds traversal budget; stopping walk");
            return Ok(true);
        }
        visited += 1;

        let mut ed = Ed::read(ctx.mem, cur)?;
        let next = ed.next();

        if ed.halted() || ed.skip() {
            ctx.transfers.cancel_for_td(ctx.stack, ed.head());
            cur = next;
            continue;
        }

        let mut serviced = 0usize;
        while ed.has_pending_td() {
            active = true;
            if serviced == MAX_TDS_PER_ED {
                warn!(ed = cur, "TD chain exceeds traversal budget; deferring");
                break;
            }
            serviced += 1;

            let progress = if ed.is_isochronous() {
                iso::service_iso_td(ctx, &mut ed, completion)?
            } else {
                service_td(ctx, &mut ed)?
            };
            if progress == TdProgress::Stop {
                break;
            }
        }

        ed.write_head(ctx.mem, cur)?;
        cur = next;
    }

    Ok(active)
}

/// Services the TD at the head of `ed`.
pub(crate) fn service_td(
    ctx: &mut ScheduleContext<'_>,
    ed: &mut Ed,
) -> Result<TdProgress, DescriptorFault> {
    let addr = ed.head();

    let completion = match &ctx.transfers.async_td {
        Some(transfer) if transfer.td_addr == addr => {
            if transfer.completed.is_none() {
                return Ok(TdProgress::Stop);
            }
            true
        }
        _ => false,
    };

    let mut td = Td::read(ctx.mem, addr)?;

    let dir = match ed.direction() {
        DIR_OUT | DIR_IN => ed.direction(),
        _ => td.direction(),
    };
    let Some(pid) = pid_for_direction(dir) else {
        warn!(td = addr, "bad direction");
        return Ok(TdProgress::Stop);
    };

    let length = if td.cbp != 0 && td.be != 0 {
        buffer_length(td.cbp, td.be)
    } else {
        0
    };
    let packet_len = if pid == UsbPid::In {
        length
    } else {
        length.min(ed.max_packet_size())
    };
    if !completion && packet_len == 0 && length != 0 {
        warn!(td = addr, length, "OUT TD on endpoint with zero max packet size");
        return Ok(TdProgress::Stop);
    }

    let result = if completion {
        let completed = ctx
            .transfers
            .async_td
            .take()
            .and_then(|transfer| transfer.completed);
        match completed {
            Some(packet) => PacketResult::from(packet),
            None => return Ok(TdProgress::Stop),
        }
    } else {
        if ctx.transfers.async_td.is_some() {
            debug!(td = addr, "too many pending packets");
            return Ok(TdProgress::Stop);
        }
        let data = if pid == UsbPid::In || packet_len == 0 {
            vec![0u8; packet_len]
        } else {
            copy_from_guest(ctx.mem, td.cbp, td.be, packet_len)?
        };
        let request = PacketRequest {
            pid,
            address: ed.function_address(),
            endpoint: ed.endpoint_number(),
            td_addr: addr,
            short_not_ok: !td.rounding(),
            int_req: td.delay_interrupt() == 0,
            data,
        };
        match ctx.dispatch(request) {
            Dispatch::Done(result) => result,
            Dispatch::Async {
                packet,
                device,
                endpoint,
            } => {
                trace!(td = addr, "packet pending asynchronously");
                ctx.transfers.async_td = Some(AsyncTransfer {
                    td_addr: addr,
                    packet,
                    device,
                    endpoint,
                    completed: None,
                });
                return Ok(TdProgress::Stop);
            }
        }
    };

    let transferred = match result.transferred() {
        Ok(n) if pid == UsbPid::In => {
            let n = n.min(packet_len).min(result.data.len());
            if n > 0 {
                copy_to_guest(ctx.mem, td.cbp, td.be, &result.data[..n])?;
            }
            Ok(n)
        }
        Ok(_) => Ok(packet_len),
        Err(status) => Err(status),
    };

    // CBP moves past whatever was transferred, even when the TD then fails as short.
    if let Ok(n) = transferred {
        if (td.cbp & OFFSET_MASK) as usize + n > 0xfff {
            td.cbp =
                (td.be & PAGE_MASK).wrapping_add(td.cbp.wrapping_add(n as u32) & OFFSET_MASK);
        } else {
            td.cbp = td.cbp.wrapping_add(n as u32);
        }
    }

    let success = match transferred {
        Ok(n) => n == packet_len || (pid == UsbPid::In && td.rounding()),
        Err(_) => false,
    };

    if success {
        let n = transferred.unwrap_or(packet_len);
        if n == length {
            td.cbp = 0;
        }
        td.advance_toggle();
        td.set_condition_code(ConditionCode::NoError);
        td.set_error_count(0);

        if pid != UsbPid::In && n != length {
            // More OUT data to send; the TD stays at the head of the ED.
            td.write(ctx.mem, addr)?;
            return Ok(TdProgress::Continue);
        }

        ed.set_toggle_carry(td.toggle());
    } else {
        let cc = match transferred {
            Ok(_) => ConditionCode::DataUnderrun,
            Err(PacketStatus::IoError | PacketStatus::NoDevice) => {
                ConditionCode::DeviceNotResponding
            }
            Err(PacketStatus::Nak) => {
                trace!(td = addr, "NAK");
                return Ok(TdProgress::Stop);
            }
            Err(PacketStatus::Stall) => ConditionCode::Stall,
            Err(PacketStatus::Babble) => ConditionCode::DataOverrun,
            Err(status) => {
                warn!(td = addr, ?status, "bad device response");
                td.set_error_count(3);
                ConditionCode::UnexpectedPid
            }
        };
        td.set_condition_code(cc);
        ed.set_halted();
    }

    // Retire the TD.
    ed.set_head(td.next());
    let delay = td.delay_interrupt();
    ctx.transfers.done.push(addr, &mut td.next_td, delay);
    let failed = td.condition_code() != ConditionCode::NoError as u8;
    if failed {
        ctx.transfers.done.flush_now();
    }
    td.write(ctx.mem, addr)?;

    Ok(if failed {
        TdProgress::Stop
    } else {
        TdProgress::Continue
    })
}
