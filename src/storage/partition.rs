use super::error::Error;
use super::{BlockingErase, FlashWriter, Region};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Phase {
    Idle,
    Writing { expected: u32 },
    Committed,
}

/// [`FlashWriter`] over a fixed window of an erasable storage device.
///
/// `begin` erases exactly the announced image size, writes append at an
/// internal cursor and `abort` erases whatever was written so a half-written
/// image can never be mistaken for a valid one.
#[derive(Debug)]
pub struct PartitionWriter<S> {
    storage: S,
    start: u32,
    len: u32,
    cursor: u32,
    phase: Phase,
}

impl<S: BlockingErase> PartitionWriter<S> {
    /// Uses `len` bytes of `storage` starting at `start`.
    pub fn new(storage: S, start: u32, len: u32) -> Self {
        Self {
            storage,
            start,
            len,
            cursor: 0,
            phase: Phase::Idle,
        }
    }

    /// Returns `true` once a complete image was committed.
    pub fn is_committed(&self) -> bool {
        self.phase == Phase::Committed
    }

    /// Bytes written since the last `begin`.
    pub fn written(&self) -> usize {
        self.cursor as usize
    }

    /// Borrows the underlying device.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Releases the underlying device.
    pub fn into_inner(self) -> S {
        self.storage
    }
}

impl<S> Region for PartitionWriter<S> {
    fn start(&self) -> u32 {
        self.start
    }

    fn end(&self) -> u32 {
        self.start.saturating_add(self.len)
    }
}

impl<S: BlockingErase> FlashWriter for PartitionWriter<S> {
    fn begin(&mut self, total_size: usize) -> Result<(), Error> {
        let total = u32::try_from(total_size).map_err(|_| Error::OutOfBounds)?;
        if total > self.len || self.end() as usize > self.storage.capacity() {
            return Err(Error::OutOfBounds);
        }
        self.storage
            .erase(self.start, self.start + total)
            .map_err(|_| Error::EraseError)?;
        self.cursor = 0;
        self.phase = Phase::Writing { expected: total };
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let Phase::Writing { expected } = self.phase else {
            return Err(Error::NotInitialized);
        };
        let len = u32::try_from(bytes.len()).map_err(|_| Error::OutOfBounds)?;
        let end = self.cursor.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > expected {
            return Err(Error::OutOfBounds);
        }
        self.storage
            .write(self.start + self.cursor, bytes)
            .map_err(|_| Error::WriteError)?;
        self.cursor = end;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        let Phase::Writing { expected } = self.phase else {
            return Err(Error::NotInitialized);
        };
        if self.cursor != expected {
            return Err(Error::Incomplete);
        }
        self.phase = Phase::Committed;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), Error> {
        if let Phase::Writing { .. } = self.phase {
            if self.cursor > 0 {
                self.storage
                    .erase(self.start, self.start + self.cursor)
                    .map_err(|_| Error::EraseError)?;
            }
        }
        self.cursor = 0;
        self.phase = Phase::Idle;
        Ok(())
    }
}
