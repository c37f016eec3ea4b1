//! Isochronous TD processing.
//!
//! An IsoTD covers `FC + 1` consecutive frames starting at its `StartingFrame`. Each pass
//! services at most the one packet belonging to the current frame and records its outcome in
//! that frame's offset/status word.

use tracing::{debug, trace, warn};

use super::descriptor::{
    psw, psw_condition_code, psw_with_condition_code, ConditionCode, DescriptorFault, Ed, IsoTd,
    DIR_IN, DIR_OUT, DIR_SETUP, ISO_OFFSET_PAGE_SELECT,
};
use super::schedule::{
    buffer_length, copy_from_guest, copy_to_guest, Dispatch, IsoTransfer, PacketRequest,
    PacketResult, ScheduleContext, TdProgress,
};
use crate::device::{PacketStatus, UsbPid};

const PAGE_MASK: u32 = !0xfff;

/// Guest address for an offset word: bit 12 selects the buffer-end page over buffer page 0.
fn offset_address(td: &IsoTd, offset: u16) -> u32 {
    let page = if offset & ISO_OFFSET_PAGE_SELECT == 0 {
        td.bp0
    } else {
        td.be
    };
    (page & PAGE_MASK) | u32::from(offset & 0xfff)
}

/// Services the IsoTD at the head of `ed` for the current frame.
///
/// In `completion` mode no new packets are dispatched.
pub(crate) fn service_iso_td(
    ctx: &mut ScheduleContext<'_>,
    ed: &mut Ed,
    completion: bool,
) -> Result<TdProgress, DescriptorFault> {
    let addr = ed.head();
    let mut td = IsoTd::read(ctx.mem, addr)?;
    let frame_count = td.frame_count();

    // A packet of this TD still owned by the device stack pins the TD until it completes.
    let pending = ctx
        .transfers
        .iso
        .iter()
        .position(|transfer| transfer.td_addr == addr);
    let (relative_frame, finished) = match pending {
        Some(i) if ctx.transfers.iso[i].completed.is_none() => return Ok(TdProgress::Stop),
        Some(i) => {
            let transfer = ctx.transfers.iso.remove(i);
            let result = transfer.completed.map(PacketResult::from);
            (transfer.relative_frame, result)
        }
        None => {
            let relative = ctx.frame_number.wrapping_sub(td.starting_frame()) as i16;
            if relative < 0 {
                // Not due yet.
                return Ok(TdProgress::Stop);
            }
            let relative = relative as u16;
            if relative > frame_count {
                debug!(td = addr, relative, frame_count, "isochronous TD expired");
                td.set_condition_code(ConditionCode::DataOverrun);
                ed.set_head(td.next());
                let delay = td.delay_interrupt();
                ctx.transfers.done.push(addr, &mut td.next_td, delay);
                td.write(ctx.mem, addr)?;
                return Ok(TdProgress::Continue);
            }
            (relative, None)
        }
    };

    let pid = match ed.direction() {
        DIR_SETUP => UsbPid::Setup,
        DIR_OUT => UsbPid::Out,
        DIR_IN => UsbPid::In,
        _ => {
            warn!(td = addr, "bad direction");
            return Ok(TdProgress::Stop);
        }
    };

    if td.bp0 == 0 || td.be == 0 {
        warn!(td = addr, "isochronous TD without buffer");
        return Ok(TdProgress::Stop);
    }

    let index = usize::from(relative_frame);
    let is_last = relative_frame == frame_count;
    let start_offset = td.offsets[index];
    let next_offset = if is_last { 0 } else { td.offsets[index + 1] };

    // Only the top three condition-code bits are inspected for "not accessed".
    if psw_condition_code(start_offset) & 0xe == 0
        || (!is_last && psw_condition_code(next_offset) & 0xe == 0)
    {
        warn!(td = addr, start_offset, next_offset, "isochronous offset not marked as unaccessed");
        return Ok(TdProgress::Stop);
    }
    if !is_last && start_offset > next_offset {
        warn!(td = addr, start_offset, next_offset, "isochronous offsets out of order");
        return Ok(TdProgress::Stop);
    }

    let start_addr = offset_address(&td, start_offset);
    let end_addr = if is_last {
        td.be
    } else {
        offset_address(&td, next_offset.wrapping_sub(1))
    };
    let len = buffer_length(start_addr, end_addr);

    let result = match finished {
        Some(result) => result,
        None if completion => return Ok(TdProgress::Stop),
        None => {
            let data = if pid == UsbPid::In || len == 0 {
                vec![0u8; len]
            } else {
                copy_from_guest(ctx.mem, start_addr, end_addr, len)?
            };
            let request = PacketRequest {
                pid,
                address: ed.function_address(),
                endpoint: ed.endpoint_number(),
                td_addr: addr,
                short_not_ok: false,
                int_req: is_last && td.delay_interrupt() == 0,
                data,
            };
            match ctx.dispatch(request) {
                Dispatch::Done(result) => result,
                Dispatch::Async {
                    packet,
                    device,
                    endpoint,
                } => {
                    trace!(td = addr, relative_frame, "isochronous packet pending");
                    ctx.transfers.iso.push(IsoTransfer {
                        td_addr: addr,
                        relative_frame,
                        packet,
                        device,
                        endpoint,
                        completed: None,
                    });
                    return Ok(TdProgress::Stop);
                }
            }
        }
    };

    let status_word = match result.transferred() {
        Ok(n) if pid == UsbPid::In && n <= len => {
            let n = n.min(result.data.len());
            if n > 0 {
                copy_to_guest(ctx.mem, start_addr, end_addr, &result.data[..n])?;
            }
            psw(ConditionCode::NoError, n)
        }
        Ok(n) if pid != UsbPid::In && n == len => psw(ConditionCode::NoError, 0),
        Ok(n) if n > len => {
            debug!(td = addr, n, len, "isochronous data overrun");
            psw(ConditionCode::DataOverrun, len)
        }
        Ok(n) => {
            debug!(td = addr, n, len, "isochronous data underrun");
            psw_with_condition_code(start_offset, ConditionCode::DataUnderrun)
        }
        Err(PacketStatus::IoError | PacketStatus::NoDevice) => {
            psw(ConditionCode::DeviceNotResponding, 0)
        }
        Err(PacketStatus::Nak | PacketStatus::Stall) => psw(ConditionCode::Stall, 0),
        Err(status) => {
            warn!(td = addr, ?status, "bad device response");
            psw_with_condition_code(start_offset, ConditionCode::UnexpectedPid)
        }
    };
    td.offsets[index] = status_word;

    if is_last {
        // Last packet of the TD: retire it.
        td.set_condition_code(ConditionCode::NoError);
        ed.set_head(td.next());
        let delay = td.delay_interrupt();
        ctx.transfers.done.push(addr, &mut td.next_td, delay);
    }
    td.write(ctx.mem, addr)?;

    Ok(TdProgress::Stop)
}
