//! Storage media behind the logical units of a mass storage instance

use core::borrow::BorrowMut;

/// Media presence and protection, as reported by [MediaProvider::check_media]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MediaStatus {
    pub ready: bool,
    pub write_protected: bool,
}

impl MediaStatus {
    pub const READY: Self = Self {
        ready: true,
        write_protected: false,
    };
    pub const ABSENT: Self = Self {
        ready: false,
        write_protected: false,
    };
    pub const READ_ONLY: Self = Self {
        ready: true,
        write_protected: true,
    };
}

/// Logical unit geometry
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capacity {
    pub block_count: u32,
    pub block_size: u32,
}

/// Media operation error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaError {
    /// The media has no such operation
    Unsupported,
    /// The operation failed
    Failed,
}

/// Storage backing a mass storage instance
///
/// Calls are synchronous and never overlap for one instance. Block buffers passed to
/// [read](MediaProvider::read) and [write](MediaProvider::write) are exactly
/// `count * block_size` bytes long.
pub trait MediaProvider {
    /// Block cache used for data stages
    type Cache: BorrowMut<[u8]>;

    fn initialize(&mut self) {}

    fn uninitialize(&mut self) {}

    /// Hands the block cache over to the engine. Called once per initialization.
    fn take_cache(&mut self) -> Option<Self::Cache>;

    fn check_media(&mut self, lun: u8) -> MediaStatus;

    fn capacity(&mut self, lun: u8) -> Result<Capacity, MediaError>;

    fn read(&mut self, lun: u8, block: u32, count: u32, buf: &mut [u8]) -> Result<(), MediaError>;

    fn write(&mut self, lun: u8, block: u32, count: u32, buf: &[u8]) -> Result<(), MediaError>;

    fn start_stop(&mut self, _lun: u8, _start: bool) -> Result<(), MediaError> {
        Err(MediaError::Unsupported)
    }

    /// Number of logical units, 0 to use the configured value
    fn max_lun(&mut self) -> u8 {
        0
    }
}
