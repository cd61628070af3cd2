//! USB Mass Storage subclasses

pub mod scsi;
