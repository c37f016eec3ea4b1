use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of bounds (gpa=0x{gpa:x}, len={len})")]
    OutOfBounds { gpa: u64, len: usize },
    #[error("guest memory access to null address (len={len})")]
    NullAddress { len: usize },
}

/// Guest-physical memory as seen by a bus-mastering device.
///
/// Implementations must be callable from both the frame timer and the thread that delivers
/// asynchronous packet completions, hence the `Send + Sync` bound and `&self` receivers.
pub trait GuestMemory: Send + Sync {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError>;
}

/// Reads from guest memory, refusing the null address.
///
/// All descriptor and buffer DMA performed by the controller goes through this function and
/// [`write_phys`].
pub fn read_phys(
    mem: &dyn GuestMemory,
    gpa: u64,
    dst: &mut [u8],
) -> Result<(), GuestMemoryError> {
    if gpa == 0 {
        return Err(GuestMemoryError::NullAddress { len: dst.len() });
    }
    mem.read(gpa, dst)
}

pub fn write_phys(mem: &dyn GuestMemory, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
    if gpa == 0 {
        return Err(GuestMemoryError::NullAddress { len: src.len() });
    }
    mem.write(gpa, src)
}

/// A simple in-memory guest memory implementation backed by a single `Vec<u8>`.
///
/// The address space starts at GPA 0.
#[derive(Debug)]
pub struct VecGuestMemory {
    data: Mutex<Vec<u8>>,
}

impl VecGuestMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size_bytes]),
        }
    }

    pub fn len(&self) -> usize {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, gpa: u64, len: usize) -> Result<std::ops::Range<usize>, GuestMemoryError> {
        let start: usize = gpa
            .try_into()
            .map_err(|_| GuestMemoryError::OutOfBounds { gpa, len })?;
        let end = start
            .checked_add(len)
            .ok_or(GuestMemoryError::OutOfBounds { gpa, len })?;
        Ok(start..end)
    }
}

impl GuestMemory for VecGuestMemory {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(gpa, dst.len())?;
        let data = self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let src = data
            .get(range)
            .ok_or(GuestMemoryError::OutOfBounds { gpa, len: dst.len() })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(gpa, src.len())?;
        let mut data = self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dst = data
            .get_mut(range)
            .ok_or(GuestMemoryError::OutOfBounds { gpa, len: src.len() })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
