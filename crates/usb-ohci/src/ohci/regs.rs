//! OHCI (USB 1.1) operational register definitions.
//!
//! Offsets, bitfields and reset values of the 25 word-aligned registers exposed through the
//! controller's MMIO window, plus the per-register mask table used by the register file.

/// Size of the OHCI MMIO register window.
pub const MMIO_SIZE: u64 = 0x1000;

/// Number of root hub ports.
pub const NUM_PORTS: usize = 4;

/// OHCI revision 1.0, as reported by `HcRevision`.
pub const OHCI_REVISION: u32 = 0x10;

pub const REG_HC_REVISION: u64 = 0x00;
pub const REG_HC_CONTROL: u64 = 0x04;
pub const REG_HC_COMMAND_STATUS: u64 = 0x08;
pub const REG_HC_INTERRUPT_STATUS: u64 = 0x0c;
pub const REG_HC_INTERRUPT_ENABLE: u64 = 0x10;
pub const REG_HC_INTERRUPT_DISABLE: u64 = 0x14;
pub const REG_HC_HCCA: u64 = 0x18;
pub const REG_HC_PERIOD_CURRENT_ED: u64 = 0x1c;
pub const REG_HC_CONTROL_HEAD_ED: u64 = 0x20;
pub const REG_HC_CONTROL_CURRENT_ED: u64 = 0x24;
pub const REG_HC_BULK_HEAD_ED: u64 = 0x28;
pub const REG_HC_BULK_CURRENT_ED: u64 = 0x2c;
pub const REG_HC_DONE_HEAD: u64 = 0x30;
pub const REG_HC_FM_INTERVAL: u64 = 0x34;
pub const REG_HC_FM_REMAINING: u64 = 0x38;
pub const REG_HC_FM_NUMBER: u64 = 0x3c;
pub const REG_HC_PERIODIC_START: u64 = 0x40;
pub const REG_HC_LS_THRESHOLD: u64 = 0x44;
pub const REG_HC_RH_DESCRIPTOR_A: u64 = 0x48;
pub const REG_HC_RH_DESCRIPTOR_B: u64 = 0x4c;
pub const REG_HC_RH_STATUS: u64 = 0x50;
pub const REG_HC_RH_PORT_STATUS_BASE: u64 = 0x54;

pub const fn reg_port_status(port: usize) -> u64 {
    REG_HC_RH_PORT_STATUS_BASE + (port as u64) * 4
}

// HcControl bits.
pub const CTL_CBSR_MASK: u32 = 0x3;
/// Periodic List Enable.
pub const CTL_PLE: u32 = 1 << 2;
/// Isochronous Enable.
pub const CTL_IE: u32 = 1 << 3;
/// Control List Enable.
pub const CTL_CLE: u32 = 1 << 4;
/// Bulk List Enable.
pub const CTL_BLE: u32 = 1 << 5;
/// Host Controller Functional State.
pub const CTL_HCFS_SHIFT: u32 = 6;
pub const CTL_HCFS_MASK: u32 = 0x3 << CTL_HCFS_SHIFT;
/// Interrupt Routing.
pub const CTL_IR: u32 = 1 << 8;
/// Remote Wakeup Connected.
pub const CTL_RWC: u32 = 1 << 9;
/// Remote Wakeup Enable.
pub const CTL_RWE: u32 = 1 << 10;

pub const HC_CONTROL_WRITE_MASK: u32 = 0x7ff;

// HcCommandStatus bits.
/// Host Controller Reset.
pub const CS_HCR: u32 = 1 << 0;
/// Control List Filled.
pub const CS_CLF: u32 = 1 << 1;
/// Bulk List Filled.
pub const CS_BLF: u32 = 1 << 2;
/// Ownership Change Request.
pub const CS_OCR: u32 = 1 << 3;
/// Scheduling Overrun Count. Never set by guest writes.
pub const CS_SOC_MASK: u32 = 0x3 << 16;

pub const HC_COMMAND_STATUS_WRITE_MASK: u32 = CS_HCR | CS_CLF | CS_BLF | CS_OCR;

// HcInterruptStatus / HcInterruptEnable / HcInterruptDisable bits.
/// Scheduling Overrun.
pub const INT_SO: u32 = 1 << 0;
/// Writeback Done Head.
pub const INT_WD: u32 = 1 << 1;
/// Start Of Frame.
pub const INT_SF: u32 = 1 << 2;
/// Resume Detected.
pub const INT_RD: u32 = 1 << 3;
/// Unrecoverable Error.
pub const INT_UE: u32 = 1 << 4;
/// Frame Number Overflow.
pub const INT_FNO: u32 = 1 << 5;
/// Root Hub Status Change.
pub const INT_RHSC: u32 = 1 << 6;
/// Ownership Change.
pub const INT_OC: u32 = 1 << 30;
/// Master Interrupt Enable (enable/disable registers only).
pub const INT_MIE: u32 = 1 << 31;

pub const INT_STATUS_MASK: u32 =
    INT_SO | INT_WD | INT_SF | INT_RD | INT_UE | INT_FNO | INT_RHSC | INT_OC;
pub const INT_ENABLE_MASK: u32 = INT_STATUS_MASK | INT_MIE;

// HcFmInterval / HcFmRemaining.
/// Frame Interval (bit times per frame minus one).
pub const FMI_FI_MASK: u32 = 0x3fff;
/// FS Largest Data Packet.
pub const FMI_FSMPS_SHIFT: u32 = 16;
/// Frame Interval Toggle.
pub const FMI_FIT: u32 = 1 << 31;
pub const HC_FM_INTERVAL_WRITE_MASK: u32 = !0xc000;
/// Frame Remaining Toggle.
pub const FMR_FRT: u32 = 1 << 31;
pub const FMR_FR_MASK: u32 = 0x3fff;

pub const HC_PERIODIC_START_WRITE_MASK: u32 = 0x3fff;
pub const HC_LS_THRESHOLD_WRITE_MASK: u32 = 0xfff;
pub const HC_HCCA_WRITE_MASK: u32 = 0xffff_ff00;
pub const HC_ED_PTR_WRITE_MASK: u32 = 0xffff_fff0;

// HcRhDescriptorA bits.
pub const RHA_NDP_MASK: u32 = 0xff;
/// No Power Switching.
pub const RHA_NPS: u32 = 1 << 9;
/// Power Switching Mode.
pub const RHA_PSM: u32 = 1 << 8;
/// No Over Current Protection.
pub const RHA_NOCP: u32 = 1 << 12;
/// Over Current Protection Mode.
pub const RHA_OCPM: u32 = 1 << 11;

// HcRhStatus bits.
/// Local Power Status (read) / Clear Global Power (write).
pub const RHS_LPS: u32 = 1 << 0;
/// Over Current Indicator.
pub const RHS_OCI: u32 = 1 << 1;
/// Device Remote Wakeup Enable (read) / Set Remote Wakeup Enable (write).
pub const RHS_DRWE: u32 = 1 << 15;
/// Local Power Status Change (read) / Set Global Power (write).
pub const RHS_LPSC: u32 = 1 << 16;
/// Over Current Indicator Change.
pub const RHS_OCIC: u32 = 1 << 17;
/// Clear Remote Wakeup Enable.
pub const RHS_CRWE: u32 = 1 << 31;

// HcRhPortStatus bits.
/// Current Connect Status (read) / Clear Port Enable (write).
pub const PORT_CCS: u32 = 1 << 0;
/// Port Enable Status (read) / Set Port Enable (write).
pub const PORT_PES: u32 = 1 << 1;
/// Port Suspend Status (read) / Set Port Suspend (write).
pub const PORT_PSS: u32 = 1 << 2;
/// Port Over Current Indicator.
pub const PORT_POCI: u32 = 1 << 3;
/// Port Reset Status (read) / Set Port Reset (write).
pub const PORT_PRS: u32 = 1 << 4;
/// Port Power Status (read) / Set Port Power (write).
pub const PORT_PPS: u32 = 1 << 8;
/// Low Speed Device Attached (read) / Clear Port Power (write).
pub const PORT_LSDA: u32 = 1 << 9;
/// Connect Status Change.
pub const PORT_CSC: u32 = 1 << 16;
/// Port Enable Status Change.
pub const PORT_PESC: u32 = 1 << 17;
/// Port Suspend Status Change.
pub const PORT_PSSC: u32 = 1 << 18;
/// Port Over Current Indicator Change.
pub const PORT_OCIC: u32 = 1 << 19;
/// Port Reset Status Change.
pub const PORT_PRSC: u32 = 1 << 20;

pub const PORT_W1C_MASK: u32 = PORT_CSC | PORT_PESC | PORT_PSSC | PORT_OCIC | PORT_PRSC;

// Reset values.
pub const HC_FM_INTERVAL_DEFAULT: u32 = (0x2778 << FMI_FSMPS_SHIFT) | 0x2edf;
pub const HC_LS_THRESHOLD_DEFAULT: u32 = 0x628;
pub const HC_RH_DESCRIPTOR_A_DEFAULT: u32 = RHA_NOCP | RHA_NPS | NUM_PORTS as u32;

/// Host Controller Functional State, the 2-bit `HcControl.HCFS` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Reset,
    Resume,
    Operational,
    Suspend,
}

impl HcState {
    pub const fn from_control(control: u32) -> Self {
        match (control & CTL_HCFS_MASK) >> CTL_HCFS_SHIFT {
            0 => HcState::Reset,
            1 => HcState::Resume,
            2 => HcState::Operational,
            _ => HcState::Suspend,
        }
    }

    pub const fn bits(self) -> u32 {
        let raw = match self {
            HcState::Reset => 0,
            HcState::Resume => 1,
            HcState::Operational => 2,
            HcState::Suspend => 3,
        };
        raw << CTL_HCFS_SHIFT
    }
}

/// How a guest write to a register is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    ReadOnly,
    /// `new = (old & !write_mask) | (value & write_mask)`.
    Masked,
    Control,
    CommandStatus,
    InterruptStatus,
    InterruptEnable,
    InterruptDisable,
    /// Accepted but discarded.
    Ignored,
    RhStatus,
    PortStatus(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInfo {
    pub name: &'static str,
    pub offset: u64,
    pub kind: RegKind,
    /// Bits a guest write may set.
    pub write_mask: u32,
    /// Bits a guest write of 1 clears.
    pub w1c_mask: u32,
    /// Bits with a defined meaning on write; anything else is logged.
    pub check_mask: u32,
}

const fn reg(
    name: &'static str,
    offset: u64,
    kind: RegKind,
    write_mask: u32,
    w1c_mask: u32,
    check_mask: u32,
) -> RegInfo {
    RegInfo {
        name,
        offset,
        kind,
        write_mask,
        w1c_mask,
        check_mask,
    }
}

const PORT_CHECK_MASK: u32 =
    PORT_CCS | PORT_PES | PORT_PSS | PORT_POCI | PORT_PRS | PORT_PPS | PORT_LSDA | PORT_W1C_MASK;

/// Register table, indexed by `offset / 4`.
pub const REGISTERS: [RegInfo; 25] = [
    reg("HcRevision", REG_HC_REVISION, RegKind::ReadOnly, 0, 0, 0),
    reg(
        "HcControl",
        REG_HC_CONTROL,
        RegKind::Control,
        HC_CONTROL_WRITE_MASK,
        0,
        HC_CONTROL_WRITE_MASK,
    ),
    reg(
        "HcCommandStatus",
        REG_HC_COMMAND_STATUS,
        RegKind::CommandStatus,
        HC_COMMAND_STATUS_WRITE_MASK,
        0,
        HC_COMMAND_STATUS_WRITE_MASK,
    ),
    reg(
        "HcInterruptStatus",
        REG_HC_INTERRUPT_STATUS,
        RegKind::InterruptStatus,
        0,
        INT_STATUS_MASK,
        INT_STATUS_MASK,
    ),
    reg(
        "HcInterruptEnable",
        REG_HC_INTERRUPT_ENABLE,
        RegKind::InterruptEnable,
        INT_ENABLE_MASK,
        0,
        INT_ENABLE_MASK,
    ),
    reg(
        "HcInterruptDisable",
        REG_HC_INTERRUPT_DISABLE,
        RegKind::InterruptDisable,
        0,
        INT_ENABLE_MASK,
        INT_ENABLE_MASK,
    ),
    reg("HcHCCA", REG_HC_HCCA, RegKind::Masked, HC_HCCA_WRITE_MASK, 0, HC_HCCA_WRITE_MASK),
    reg("HcPeriodCurrentED", REG_HC_PERIOD_CURRENT_ED, RegKind::ReadOnly, 0, 0, 0),
    reg(
        "HcControlHeadED",
        REG_HC_CONTROL_HEAD_ED,
        RegKind::Masked,
        HC_ED_PTR_WRITE_MASK,
        0,
        HC_ED_PTR_WRITE_MASK,
    ),
    reg(
        "HcControlCurrentED",
        REG_HC_CONTROL_CURRENT_ED,
        RegKind::Masked,
        HC_ED_PTR_WRITE_MASK,
        0,
        HC_ED_PTR_WRITE_MASK,
    ),
    reg(
        "HcBulkHeadED",
        REG_HC_BULK_HEAD_ED,
        RegKind::Masked,
        HC_ED_PTR_WRITE_MASK,
        0,
        HC_ED_PTR_WRITE_MASK,
    ),
    reg(
        "HcBulkCurrentED",
        REG_HC_BULK_CURRENT_ED,
        RegKind::Masked,
        HC_ED_PTR_WRITE_MASK,
        0,
        HC_ED_PTR_WRITE_MASK,
    ),
    reg("HcDoneHead", REG_HC_DONE_HEAD, RegKind::ReadOnly, 0, 0, 0),
    reg(
        "HcFmInterval",
        REG_HC_FM_INTERVAL,
        RegKind::Masked,
        HC_FM_INTERVAL_WRITE_MASK,
        0,
        HC_FM_INTERVAL_WRITE_MASK,
    ),
    reg("HcFmRemaining", REG_HC_FM_REMAINING, RegKind::ReadOnly, 0, 0, 0),
    reg("HcFmNumber", REG_HC_FM_NUMBER, RegKind::ReadOnly, 0, 0, 0),
    reg(
        "HcPeriodicStart",
        REG_HC_PERIODIC_START,
        RegKind::Masked,
        HC_PERIODIC_START_WRITE_MASK,
        0,
        HC_PERIODIC_START_WRITE_MASK,
    ),
    reg(
        "HcLSThreshold",
        REG_HC_LS_THRESHOLD,
        RegKind::Masked,
        HC_LS_THRESHOLD_WRITE_MASK,
        0,
        HC_LS_THRESHOLD_WRITE_MASK,
    ),
    reg("HcRhDescriptorA", REG_HC_RH_DESCRIPTOR_A, RegKind::Masked, 0, 0, 0xff00_1fff),
    reg("HcRhDescriptorB", REG_HC_RH_DESCRIPTOR_B, RegKind::Ignored, 0, 0, u32::MAX),
    reg(
        "HcRhStatus",
        REG_HC_RH_STATUS,
        RegKind::RhStatus,
        RHS_DRWE,
        RHS_OCIC,
        RHS_LPS | RHS_OCI | RHS_DRWE | RHS_LPSC | RHS_OCIC | RHS_CRWE,
    ),
    reg(
        "HcRhPortStatus[0]",
        reg_port_status(0),
        RegKind::PortStatus(0),
        0,
        PORT_W1C_MASK,
        PORT_CHECK_MASK,
    ),
    reg(
        "HcRhPortStatus[1]",
        reg_port_status(1),
        RegKind::PortStatus(1),
        0,
        PORT_W1C_MASK,
        PORT_CHECK_MASK,
    ),
    reg(
        "HcRhPortStatus[2]",
        reg_port_status(2),
        RegKind::PortStatus(2),
        0,
        PORT_W1C_MASK,
        PORT_CHECK_MASK,
    ),
    reg(
        "HcRhPortStatus[3]",
        reg_port_status(3),
        RegKind::PortStatus(3),
        0,
        PORT_W1C_MASK,
        PORT_CHECK_MASK,
    ),
];

/// Looks up a register by its word-aligned offset.
pub fn reg_info(offset: u64) -> Option<&'static RegInfo> {
    if offset % 4 != 0 {
        return None;
    }
    REGISTERS.get(usize::try_from(offset / 4).ok()?)
}
