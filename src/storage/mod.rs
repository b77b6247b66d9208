//! # Storage abstraction for firmware images
//!
//! The byte-addressed traits ([`ReadStorage`], [`Storage`], [`BlockingErase`])
//! describe a flash device or a partition of one. On top of them sits
//! [`FlashWriter`], the sequential sink the firmware update controller streams
//! a downloaded image into:
//!
//! ```text
//! begin(total) ──► write(chunk) ──► write(chunk) ──► … ──► commit()
//!      │                 │                                   │
//!      └── erase range   └── append at cursor                └── image complete
//!
//!                          any failure or bad checksum ──► abort()
//! ```
//!
//! [`PartitionWriter`] implements [`FlashWriter`] for any erasable
//! [`Storage`], so a board support crate only has to expose its update
//! partition through the three byte-level traits.
//!
//! ```rust
//! use cloudlink::storage::{FlashWriter, PartitionWriter, Storage};
//! # use cloudlink::storage::{BlockingErase, ReadStorage, error::Error};
//! # struct Ram([u8; 64]);
//! # impl ReadStorage for Ram {
//! #     type Error = Error;
//! #     fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
//! #         let o = offset as usize;
//! #         bytes.copy_from_slice(&self.0[o..o + bytes.len()]);
//! #         Ok(())
//! #     }
//! #     fn capacity(&self) -> usize { 64 }
//! # }
//! # impl Storage for Ram {
//! #     fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
//! #         let o = offset as usize;
//! #         self.0[o..o + bytes.len()].copy_from_slice(bytes);
//! #         Ok(())
//! #     }
//! # }
//! # impl BlockingErase for Ram {
//! #     fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
//! #         self.0[from as usize..to as usize].fill(0xFF);
//! #         Ok(())
//! #     }
//! # }
//! let mut writer = PartitionWriter::new(Ram([0; 64]), 0, 64);
//! writer.begin(4).unwrap();
//! writer.write(&[1, 2, 3, 4]).unwrap();
//! writer.commit().unwrap();
//! assert!(writer.is_committed());
//! ```

#![deny(unsafe_code)]

/// Error type shared by the storage layer.
pub mod error;

mod partition;


pub use self::partition::PartitionWriter;

use self::error::Error;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{BlockingErase, FlashWriter, ReadStorage, Region, Storage};
}

/// A contiguous address range.
pub trait Region {
    /// First address of the region.
    fn start(&self) -> u32;
    /// One past the last address of the region.
    fn end(&self) -> u32;
    /// Returns `true` if `address` lies inside the region.
    fn contains(&self, address: u32) -> bool {
        (address >= self.start()) && (address < self.end())
    }
}

/// Random-access reads.
pub trait ReadStorage {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Reads `bytes.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;
    /// Total size in bytes.
    fn capacity(&self) -> usize;
}

/// Random-access writes.
pub trait Storage: ReadStorage {
    /// Writes `bytes` starting at `offset`.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Erase support for flash-like devices.
pub trait BlockingErase: Storage {
    /// Erases the range `from..to`.
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error>;
}

/// Sequential sink for a firmware image.
///
/// The update controller calls [`begin`](FlashWriter::begin) once, then
/// [`write`](FlashWriter::write) for every chunk in order, and finishes with
/// exactly one of [`commit`](FlashWriter::commit) or
/// [`abort`](FlashWriter::abort).
pub trait FlashWriter {
    /// Prepares for an image of `total_size` bytes.
    fn begin(&mut self, total_size: usize) -> Result<(), Error>;
    /// Appends the next slice of the image.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;
    /// Marks the complete image as valid.
    fn commit(&mut self) -> Result<(), Error>;
    /// Discards whatever was written since `begin`.
    fn abort(&mut self) -> Result<(), Error>;
}

impl<W: FlashWriter + ?Sized> FlashWriter for alloc::boxed::Box<W> {
    fn begin(&mut self, total_size: usize) -> Result<(), Error> {
        (**self).begin(total_size)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(bytes)
    }

    fn commit(&mut self) -> Result<(), Error> {
        (**self).commit()
    }

    fn abort(&mut self) -> Result<(), Error> {
        (**self).abort()
    }
}
