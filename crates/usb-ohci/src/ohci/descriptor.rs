//! Guest-resident OHCI data structures: ED, general TD, isochronous TD and the HCCA.
//!
//! Each structure is read into a plain copy of its little-endian words, inspected and modified
//! through accessor functions that keep the hardware bit positions, and written back explicitly.

use thiserror::Error;

use crate::memory::{read_phys, write_phys, GuestMemory, GuestMemoryError};

pub const ED_SIZE: usize = 16;
pub const TD_SIZE: usize = 16;
pub const ISO_TD_SIZE: usize = 32;
pub const HCCA_SIZE: usize = 256;

/// Offset of the frame number within the HCCA. The frame number, its pad and the done head are
/// the only bytes the controller writes back.
pub const HCCA_WRITEBACK_OFFSET: u64 = 0x80;
pub const HCCA_WRITEBACK_LEN: usize = 8;

pub const HCCA_INTERRUPT_TABLE_LEN: usize = 32;

/// Mask for ED/TD link pointers.
pub const DPTR_MASK: u32 = 0xffff_fff0;

// ED Flags.
pub const ED_FA_MASK: u32 = 0x7f;
pub const ED_EN_SHIFT: u32 = 7;
pub const ED_EN_MASK: u32 = 0xf << ED_EN_SHIFT;
pub const ED_D_SHIFT: u32 = 11;
pub const ED_D_MASK: u32 = 0x3 << ED_D_SHIFT;
/// Low speed.
pub const ED_S: u32 = 1 << 13;
/// Skip.
pub const ED_K: u32 = 1 << 14;
/// Isochronous format.
pub const ED_F: u32 = 1 << 15;
pub const ED_MPS_SHIFT: u32 = 16;
pub const ED_MPS_MASK: u32 = 0x7ff << ED_MPS_SHIFT;

// ED HeadP flags.
/// Halted.
pub const ED_HEAD_H: u32 = 1 << 0;
/// Toggle carry.
pub const ED_HEAD_C: u32 = 1 << 1;

// TD Flags.
/// Buffer rounding.
pub const TD_R: u32 = 1 << 18;
pub const TD_DP_SHIFT: u32 = 19;
pub const TD_DP_MASK: u32 = 0x3 << TD_DP_SHIFT;
pub const TD_DI_SHIFT: u32 = 21;
pub const TD_DI_MASK: u32 = 0x7 << TD_DI_SHIFT;
pub const TD_T0: u32 = 1 << 24;
/// Toggle taken from the TD rather than the ED carry.
pub const TD_T1: u32 = 1 << 25;
pub const TD_EC_SHIFT: u32 = 26;
pub const TD_EC_MASK: u32 = 0x3 << TD_EC_SHIFT;
pub const TD_CC_SHIFT: u32 = 28;
pub const TD_CC_MASK: u32 = 0xf << TD_CC_SHIFT;

// IsoTD Flags.
pub const ISO_SF_MASK: u32 = 0xffff;
pub const ISO_FC_SHIFT: u32 = 24;
pub const ISO_FC_MASK: u32 = 0x7 << ISO_FC_SHIFT;

// Iso offset / packet status word.
pub const PSW_SIZE_MASK: u16 = 0x0fff;
pub const PSW_CC_SHIFT: u16 = 12;
pub const PSW_CC_MASK: u16 = 0xf << PSW_CC_SHIFT;
/// Offset bit selecting the buffer-end page instead of buffer page 0.
pub const ISO_OFFSET_PAGE_SELECT: u16 = 1 << 12;

/// Direction encoding shared by `ED.D` and `TD.DP`.
pub const DIR_SETUP: u32 = 0;
pub const DIR_OUT: u32 = 1;
pub const DIR_IN: u32 = 2;
pub const DIR_RESERVED: u32 = 3;

/// Completion codes written into TD/IsoTD `CC` fields and packet status words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0x0,
    Crc = 0x1,
    BitStuffing = 0x2,
    DataToggleMismatch = 0x3,
    Stall = 0x4,
    DeviceNotResponding = 0x5,
    PidCheckFailure = 0x6,
    UnexpectedPid = 0x7,
    DataOverrun = 0x8,
    DataUnderrun = 0x9,
    BufferOverrun = 0xc,
    BufferUnderrun = 0xd,
    NotAccessed = 0xe,
}

impl ConditionCode {
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Guest memory failure while touching a controller data structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorFault {
    #[error("HCCA access at 0x{addr:08x} failed: {source}")]
    Hcca {
        addr: u32,
        #[source]
        source: GuestMemoryError,
    },
    #[error("ED access at 0x{addr:08x} failed: {source}")]
    Ed {
        addr: u32,
        #[source]
        source: GuestMemoryError,
    },
    #[error("TD access at 0x{addr:08x} failed: {source}")]
    Td {
        addr: u32,
        #[source]
        source: GuestMemoryError,
    },
    #[error("isochronous TD access at 0x{addr:08x} failed: {source}")]
    IsoTd {
        addr: u32,
        #[source]
        source: GuestMemoryError,
    },
    #[error("data buffer access at 0x{addr:08x} failed: {source}")]
    Buffer {
        addr: u32,
        #[source]
        source: GuestMemoryError,
    },
}

fn read_words<const N: usize>(
    mem: &dyn GuestMemory,
    addr: u32,
) -> Result<[u32; N], GuestMemoryError> {
    let mut raw = [0u8; 32];
    let bytes = &mut raw[..N * 4];
    read_phys(mem, u64::from(addr), bytes)?;
    let mut words = [0u32; N];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(words)
}

fn write_words(mem: &dyn GuestMemory, addr: u32, words: &[u32]) -> Result<(), GuestMemoryError> {
    let mut raw = [0u8; 32];
    for (chunk, word) in raw.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    write_phys(mem, u64::from(addr), &raw[..words.len() * 4])
}

/// Endpoint Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ed {
    pub flags: u32,
    pub tail_p: u32,
    pub head_p: u32,
    pub next_ed: u32,
}

impl Ed {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorFault> {
        let [flags, tail_p, head_p, next_ed] =
            read_words::<4>(mem, addr).map_err(|source| DescriptorFault::Ed { addr, source })?;
        Ok(Self {
            flags,
            tail_p,
            head_p,
            next_ed,
        })
    }

    /// Writes back HeadP, the only ED field the controller owns.
    pub fn write_head(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorFault> {
        let head_addr = addr.wrapping_add(8);
        write_words(mem, head_addr, &[self.head_p]).map_err(|source| DescriptorFault::Ed {
            addr: head_addr,
            source,
        })
    }

    pub fn function_address(&self) -> u8 {
        (self.flags & ED_FA_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.flags & ED_EN_MASK) >> ED_EN_SHIFT) as u8
    }

    pub fn direction(&self) -> u32 {
        (self.flags & ED_D_MASK) >> ED_D_SHIFT
    }

    pub fn is_low_speed(&self) -> bool {
        self.flags & ED_S != 0
    }

    pub fn skip(&self) -> bool {
        self.flags & ED_K != 0
    }

    pub fn is_isochronous(&self) -> bool {
        self.flags & ED_F != 0
    }

    pub fn max_packet_size(&self) -> usize {
        ((self.flags & ED_MPS_MASK) >> ED_MPS_SHIFT) as usize
    }

    pub fn halted(&self) -> bool {
        self.head_p & ED_HEAD_H != 0
    }

    pub fn set_halted(&mut self) {
        self.head_p |= ED_HEAD_H;
    }

    pub fn toggle_carry(&self) -> bool {
        self.head_p & ED_HEAD_C != 0
    }

    pub fn set_toggle_carry(&mut self, carry: bool) {
        if carry {
            self.head_p |= ED_HEAD_C;
        } else {
            self.head_p &= !ED_HEAD_C;
        }
    }

    pub fn head(&self) -> u32 {
        self.head_p & DPTR_MASK
    }

    /// Replaces the head pointer, preserving the Halted and toggle-carry flags.
    pub fn set_head(&mut self, td: u32) {
        self.head_p = (self.head_p & !DPTR_MASK) | (td & DPTR_MASK);
    }

    pub fn tail(&self) -> u32 {
        self.tail_p & DPTR_MASK
    }

    pub fn next(&self) -> u32 {
        self.next_ed & DPTR_MASK
    }

    /// Whether the ED still has TDs queued between head and tail.
    pub fn has_pending_td(&self) -> bool {
        self.head() != self.tail()
    }
}

/// General Transfer Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Td {
    pub flags: u32,
    pub cbp: u32,
    pub next_td: u32,
    pub be: u32,
}

impl Td {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorFault> {
        let [flags, cbp, next_td, be] =
            read_words::<4>(mem, addr).map_err(|source| DescriptorFault::Td { addr, source })?;
        Ok(Self {
            flags,
            cbp,
            next_td,
            be,
        })
    }

    pub fn write(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorFault> {
        write_words(mem, addr, &[self.flags, self.cbp, self.next_td, self.be])
            .map_err(|source| DescriptorFault::Td { addr, source })
    }

    pub fn rounding(&self) -> bool {
        self.flags & TD_R != 0
    }

    pub fn direction(&self) -> u32 {
        (self.flags & TD_DP_MASK) >> TD_DP_SHIFT
    }

    pub fn delay_interrupt(&self) -> u8 {
        ((self.flags & TD_DI_MASK) >> TD_DI_SHIFT) as u8
    }

    pub fn toggle(&self) -> bool {
        self.flags & TD_T0 != 0
    }

    pub fn condition_code(&self) -> u8 {
        ((self.flags & TD_CC_MASK) >> TD_CC_SHIFT) as u8
    }

    pub fn set_condition_code(&mut self, cc: ConditionCode) {
        self.flags = (self.flags & !TD_CC_MASK) | (cc.bits() << TD_CC_SHIFT);
    }

    pub fn set_error_count(&mut self, count: u32) {
        self.flags = (self.flags & !TD_EC_MASK) | ((count << TD_EC_SHIFT) & TD_EC_MASK);
    }

    /// Records a successful data phase: the toggle now lives in the TD and flips.
    pub fn advance_toggle(&mut self) {
        self.flags |= TD_T1;
        self.flags ^= TD_T0;
    }

    pub fn next(&self) -> u32 {
        self.next_td & DPTR_MASK
    }
}

/// Isochronous Transfer Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTd {
    pub flags: u32,
    pub bp0: u32,
    pub next_td: u32,
    pub be: u32,
    pub offsets: [u16; 8],
}

impl IsoTd {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorFault> {
        let words = read_words::<8>(mem, addr)
            .map_err(|source| DescriptorFault::IsoTd { addr, source })?;
        let mut offsets = [0u16; 8];
        for (i, word) in words[4..].iter().enumerate() {
            offsets[i * 2] = *word as u16;
            offsets[i * 2 + 1] = (*word >> 16) as u16;
        }
        Ok(Self {
            flags: words[0],
            bp0: words[1],
            next_td: words[2],
            be: words[3],
            offsets,
        })
    }

    pub fn write(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorFault> {
        let mut words = [self.flags, self.bp0, self.next_td, self.be, 0, 0, 0, 0];
        for (i, pair) in self.offsets.chunks_exact(2).enumerate() {
            words[4 + i] = u32::from(pair[0]) | (u32::from(pair[1]) << 16);
        }
        write_words(mem, addr, &words).map_err(|source| DescriptorFault::IsoTd { addr, source })
    }

    pub fn starting_frame(&self) -> u16 {
        (self.flags & ISO_SF_MASK) as u16
    }

    /// Index of the last scheduled packet (`FC`), so the TD covers `frame_count() + 1` frames.
    pub fn frame_count(&self) -> u16 {
        ((self.flags & ISO_FC_MASK) >> ISO_FC_SHIFT) as u16
    }

    pub fn delay_interrupt(&self) -> u8 {
        ((self.flags & TD_DI_MASK) >> TD_DI_SHIFT) as u8
    }

    pub fn set_condition_code(&mut self, cc: ConditionCode) {
        self.flags = (self.flags & !TD_CC_MASK) | (cc.bits() << TD_CC_SHIFT);
    }

    pub fn next(&self) -> u32 {
        self.next_td & DPTR_MASK
    }
}

/// Condition code nibble of an isochronous offset / packet status word.
pub const fn psw_condition_code(word: u16) -> u16 {
    (word & PSW_CC_MASK) >> PSW_CC_SHIFT
}

pub const fn psw_with_condition_code(word: u16, cc: ConditionCode) -> u16 {
    (word & !PSW_CC_MASK) | ((cc as u16) << PSW_CC_SHIFT)
}

pub const fn psw(cc: ConditionCode, size: usize) -> u16 {
    ((cc as u16) << PSW_CC_SHIFT) | (size as u16 & PSW_SIZE_MASK)
}

/// Host Controller Communication Area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hcca {
    pub interrupt_table: [u32; HCCA_INTERRUPT_TABLE_LEN],
    pub frame_number: u16,
    pub pad1: u16,
    pub done_head: u32,
}

impl Hcca {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorFault> {
        let mut raw = [0u8; HCCA_SIZE];
        read_phys(mem, u64::from(addr), &mut raw)
            .map_err(|source| DescriptorFault::Hcca { addr, source })?;
        let word =
            |off: usize| u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        let mut interrupt_table = [0u32; HCCA_INTERRUPT_TABLE_LEN];
        for (i, entry) in interrupt_table.iter_mut().enumerate() {
            *entry = word(i * 4);
        }
        Ok(Self {
            interrupt_table,
            frame_number: u16::from_le_bytes([raw[0x80], raw[0x81]]),
            pad1: u16::from_le_bytes([raw[0x82], raw[0x83]]),
            done_head: word(0x84),
        })
    }

    /// Writes back the frame number and done head, leaving the interrupt table untouched.
    pub fn write_back(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorFault> {
        let mut raw = [0u8; HCCA_WRITEBACK_LEN];
        raw[0..2].copy_from_slice(&self.frame_number.to_le_bytes());
        raw[2..4].copy_from_slice(&self.pad1.to_le_bytes());
        raw[4..8].copy_from_slice(&self.done_head.to_le_bytes());
        let target = u64::from(addr) + HCCA_WRITEBACK_OFFSET;
        write_phys(mem, target, &raw).map_err(|source| DescriptorFault::Hcca { addr, source })
    }
}
