//! USB Mass Storage Bulk-Only Transport for embedded USB devices
//!
//! # Layers:
//! * [Endpoint access] - the only path to the hardware endpoints: locking, retries,
//!   active transfer and halt bookkeeping, interrupt to worker event dispatch
//! * [SCSI] over [Bulk Only] - the mass storage protocol engine, backed by a [media provider]
//! * [Registry] - instances addressed by handles for control requests
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//! | `log` | Enable logging via [log](https://crates.io/crates/log) crate |
//!
//! [Endpoint access]: crate::driver
//! [SCSI]: crate::subclass::scsi
//! [Bulk Only]: crate::transport::bbb
//! [media provider]: crate::media::MediaProvider
//! [Registry]: crate::registry

#![no_std]

pub(crate) mod fmt;
pub mod driver;
pub mod media;
pub mod msc;
pub mod registry;
pub mod rtos;
pub mod subclass;
pub mod transport;
