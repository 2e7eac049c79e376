//! USB mass-storage drivers for crabmsc
//!
//! # Layers
//! - `controller` - the raw endpoint seam provided by the host platform
//! - `scsi` - SCSI transparent command set (CDBs, sense data, responses)
//! - `mass_storage` - Bulk-Only Transport engine with retry and reset recovery
//!
//! # Architecture
//!
//! The platform implements `UsbCommunication` for one claimed interface;
//! `UsbMassStorage` drives it and exposes the result as a `BlockDevice`.

pub mod controller;
pub mod mass_storage;
pub mod scsi;

pub use self::controller::{UsbCommunication, UsbError};
pub use mass_storage::{MassStorageError, TransportConfig, UsbMassStorage};
