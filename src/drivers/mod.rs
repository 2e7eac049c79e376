//! Device drivers
//!
//! - `usb`: the Bulk-Only mass-storage transport over a platform USB seam
//! - `block`: block device abstraction shared by the transport and filesystems
//! - `storage`: one attached device with its mounted partitions

pub mod block;
pub mod storage;
pub mod usb;
