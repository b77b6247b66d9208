//! Incremental image checksums.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::str::FromStr;

use sha2::Digest;

use crate::error::Error;

/// Checksum algorithms the platform may announce for an image.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChecksumAlgorithm {
    /// `MD5`
    Md5,
    /// `SHA256`
    Sha256,
    /// `SHA384`
    Sha384,
    /// `SHA512`
    Sha512,
}

impl ChecksumAlgorithm {
    /// Name as it appears in `fw_checksum_algorithm`.
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha384 => "SHA384",
            ChecksumAlgorithm::Sha512 => "SHA512",
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    /// Exact, case-sensitive match.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "MD5" => Ok(ChecksumAlgorithm::Md5),
            "SHA256" => Ok(ChecksumAlgorithm::Sha256),
            "SHA384" => Ok(ChecksumAlgorithm::Sha384),
            "SHA512" => Ok(ChecksumAlgorithm::Sha512),
            _ => Err(Error::Protocol("unsupported checksum algorithm")),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ChecksumAlgorithm {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=str}", self.as_str())
    }
}

/// Running digest over the downloaded image.
pub trait HashAccumulator {
    /// Feeds the next slice of the image.
    fn update(&mut self, bytes: &[u8]);
    /// Finishes and returns the lowercase hex digest.
    fn digest_hex(self: Box<Self>) -> String;
}

/// Builds the accumulator for an announced algorithm.
pub type HasherFactory = fn(ChecksumAlgorithm) -> Box<dyn HashAccumulator>;

struct RustCrypto<D>(D);

impl<D: Digest> HashAccumulator for RustCrypto<D> {
    fn update(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.0, bytes);
    }

    fn digest_hex(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Software implementation of every [`ChecksumAlgorithm`].
pub fn software_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn HashAccumulator> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(RustCrypto(md5::Md5::new())),
        ChecksumAlgorithm::Sha256 => Box::new(RustCrypto(sha2::Sha256::new())),
        ChecksumAlgorithm::Sha384 => Box::new(RustCrypto(sha2::Sha384::new())),
        ChecksumAlgorithm::Sha512 => Box::new(RustCrypto(sha2::Sha512::new())),
    }
}
