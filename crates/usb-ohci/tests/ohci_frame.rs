mod util;

use usb_ohci::ohci::regs::*;
use util::*;

#[test]
fn entering_operational_raises_start_of_frame() {
    init_tracing();
    let mut h = Harness::new();
    assert!(!h.ohci.bus_running());

    h.start(0);
    assert!(h.ohci.bus_running());
    assert_ne!(h.interrupt_status() & INT_SF, 0);

    h.clear_interrupts();
    assert_eq!(h.run_frame(), 1);
    assert_ne!(h.interrupt_status() & INT_SF, 0);
}

#[test]
fn frame_number_is_mirrored_into_hcca() {
    let mut h = Harness::new();
    h.start(0);

    h.run_frames(5);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 5);
    assert_eq!(h.hcca_frame_number(), 5);
}

#[test]
fn frame_number_wraps_after_65536_frames() {
    let mut h = Harness::new();
    h.start(0);

    h.run_frames(0xffff);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 0xffff);
    assert_eq!(h.hcca_frame_number(), 0xffff);

    h.run_frame();
    assert_eq!(h.read(REG_HC_FM_NUMBER), 0);
    assert_eq!(h.hcca_frame_number(), 0);
}

#[test]
fn hcca_write_back_only_touches_frame_and_done_words() {
    let mut h = Harness::new();
    let marker = [0xa5u8; 0x78];
    h.write_bytes(HCCA_ADDR + 0x88, &marker);
    h.set_interrupt_table(0);
    h.write_u32(HCCA_ADDR + 0x80, 0xbeef_0000);

    h.start(0);
    h.run_frames(3);

    assert_eq!(h.read_bytes(HCCA_ADDR + 0x88, marker.len()), marker);
    // The pad half-word next to the frame number is preserved.
    assert_eq!(h.read_u32(HCCA_ADDR + 0x80), 0xbeef_0003);
}

#[test]
fn suspend_stops_and_operational_restarts_frames() {
    let mut h = Harness::new();
    h.start(0);
    h.run_frames(2);

    h.write(REG_HC_CONTROL, HcState::Suspend.bits());
    assert!(!h.ohci.bus_running());
    assert_eq!(h.run_frame(), 0);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 2);

    h.clear_interrupts();
    h.write(REG_HC_CONTROL, HcState::Operational.bits());
    assert_ne!(h.interrupt_status() & INT_SF, 0);
    assert_eq!(h.run_frame(), 1);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 3);
}

#[test]
fn resume_state_does_not_run_frames() {
    let mut h = Harness::new();
    h.start(0);
    h.write(REG_HC_CONTROL, HcState::Suspend.bits());
    h.write(REG_HC_CONTROL, HcState::Resume.bits());
    assert_eq!(h.run_frame(), 0);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 0);
}

#[test]
fn missing_hcca_is_unrecoverable() {
    let mut h = Harness::new();
    h.write(REG_HC_INTERRUPT_ENABLE, INT_UE);
    h.write(REG_HC_CONTROL, HcState::Operational.bits());

    assert_eq!(h.run_frame(), 1);
    assert_ne!(h.interrupt_status() & INT_UE, 0);
    assert!(h.ohci.irq_level());
    assert!(!h.ohci.bus_running());
    assert_eq!(h.read(REG_HC_FM_NUMBER), 0);

    assert_eq!(h.run_frame(), 0);
}

#[test]
fn hcca_outside_guest_memory_is_unrecoverable() {
    let mut h = Harness::new();
    h.write(REG_HC_HCCA, 0xffff_ff00);
    h.write(REG_HC_CONTROL, HcState::Operational.bits());

    h.run_frame();
    assert_ne!(h.interrupt_status() & INT_UE, 0);
    assert!(!h.ohci.bus_running());

    // A software reset clears the error and the controller can run again.
    h.write(REG_HC_COMMAND_STATUS, CS_HCR);
    assert_eq!(h.interrupt_status(), 0);
    h.start(0);
    assert_eq!(h.run_frame(), 1);
    assert_eq!(h.read(REG_HC_FM_NUMBER), 1);
}

#[test]
fn frame_remaining_toggle_tracks_interval_toggle() {
    let mut h = Harness::new();
    h.start(0);
    h.write(REG_HC_FM_INTERVAL, HC_FM_INTERVAL_DEFAULT | FMI_FIT);
    assert_eq!(h.read(REG_HC_FM_REMAINING) & FMR_FRT, 0);

    h.run_frame();
    assert_eq!(h.read(REG_HC_FM_REMAINING) & FMR_FRT, FMR_FRT);
}

#[test]
fn done_queue_waits_for_delay_interrupt_count() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 3, 8);
    h.stack.push_response(Response::Ack);
    h.start(CTL_CLE);
    h.clear_interrupts();

    h.run_frame();
    assert_eq!(h.read(REG_HC_DONE_HEAD), TD_BASE);
    assert_eq!(h.ohci.done_count(), 2);
    h.run_frame();
    assert_eq!(h.ohci.done_count(), 1);
    h.run_frame();
    assert_eq!(h.ohci.done_count(), 0);
    assert_eq!(h.interrupt_status() & INT_WD, 0);
    assert_eq!(h.hcca_done_head(), 0);

    h.run_frame();
    assert_ne!(h.interrupt_status() & INT_WD, 0);
    assert_eq!(h.hcca_done_head(), TD_BASE);
    assert_eq!(h.read(REG_HC_DONE_HEAD), 0);
    assert_eq!(h.ohci.done_count(), 7);
}

#[test]
fn zero_delay_flushes_in_the_retiring_frame() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 0, 8);
    h.stack.push_response(Response::Ack);
    h.start(CTL_CLE);
    h.clear_interrupts();

    h.run_frame();
    assert_ne!(h.interrupt_status() & INT_WD, 0);
    assert_eq!(h.hcca_done_head(), TD_BASE);
    assert_eq!(read_td(&h, TD_BASE)[2], 0);
}

#[test]
fn delay_seven_never_flushes_on_its_own() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 7, 8);
    h.stack.push_response(Response::Ack);
    h.start(CTL_CLE);

    h.run_frames(20);
    assert_eq!(h.read(REG_HC_DONE_HEAD), TD_BASE);
    assert_eq!(h.interrupt_status() & INT_WD, 0);
    assert_eq!(h.ohci.done_count(), 7);
}

#[test]
fn td_error_flushes_done_queue_immediately() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 7, 8);
    h.stack.push_response(Response::Stall);
    h.start(CTL_CLE);
    h.clear_interrupts();

    h.run_frame();
    assert_ne!(h.interrupt_status() & INT_WD, 0);
    assert_eq!(h.hcca_done_head(), TD_BASE);
    assert_eq!(td_cc(read_td(&h, TD_BASE)[0]), 4);
}

#[test]
fn pending_writeback_holds_next_flush() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 0, 8);
    h.stack.push_response(Response::Ack);
    h.stack.push_response(Response::Ack);
    h.start(CTL_CLE);
    h.clear_interrupts();

    h.run_frame();
    assert_eq!(h.hcca_done_head(), TD_BASE);

    // Turn the old tail into a real TD and append a new tail.
    let tail2 = TAIL_TD + 0x10;
    write_td(&h, TAIL_TD, td_flags(OUT, 0), BUF_BASE, tail2, BUF_BASE + 7);
    h.write_u32(ED_BASE + 4, tail2);
    h.write(REG_HC_COMMAND_STATUS, CS_CLF);

    h.run_frames(3);
    assert_eq!(h.ohci.done_count(), 0);
    assert_eq!(h.read(REG_HC_DONE_HEAD), TAIL_TD);
    assert_eq!(h.hcca_done_head(), TD_BASE);

    h.write(REG_HC_INTERRUPT_STATUS, INT_WD);
    h.run_frame();
    assert_eq!(h.hcca_done_head(), TAIL_TD);
    assert_ne!(h.interrupt_status() & INT_WD, 0);
}

#[test]
fn done_head_lsb_flags_other_pending_interrupts() {
    let mut h = Harness::new();
    h.plug(0, 1);
    queue_single_td(&mut h, OUT, 0, 8);
    h.stack.push_response(Response::Ack);
    h.write(REG_HC_INTERRUPT_ENABLE, INT_SF);
    h.start(CTL_CLE);

    h.run_frame();
    assert_eq!(h.hcca_done_head(), TD_BASE | 1);
}
