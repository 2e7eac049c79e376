//! USB Core Abstraction Layer
//!
//! The host OS enumerates the device, grants permission and hands us raw
//! access to one mass-storage interface: a bulk-IN endpoint, a bulk-OUT
//! endpoint and the default control pipe. This module defines that seam.
//!
//! # Architecture
//!
//! - Platform glue (libusb, usbfs, Android `UsbDeviceConnection`, ...) implements
//!   the `UsbCommunication` trait
//! - The Bulk-Only Transport driver in `mass_storage` only talks to the trait
//! - Tests implement the trait with a scripted in-memory drive

use thiserror::Error;

// ============================================================================
// USB Request Types and Standard Requests
// ============================================================================

/// USB request type fields
pub mod req_type {
    /// Direction: Host to Device
    pub const DIR_OUT: u8 = 0x00;

    /// Type: Standard
    pub const TYPE_STANDARD: u8 = 0x00;
    /// Type: Class
    pub const TYPE_CLASS: u8 = 0x20;

    /// Recipient: Interface
    pub const RCPT_INTERFACE: u8 = 0x01;
    /// Recipient: Endpoint
    pub const RCPT_ENDPOINT: u8 = 0x02;
}

/// USB standard requests
pub mod request {
    pub const CLEAR_FEATURE: u8 = 0x01;

    /// Feature selector for CLEAR_FEATURE on an endpoint
    pub const ENDPOINT_HALT: u16 = 0x00;
}

/// Mass Storage class-specific requests
pub mod msc_request {
    /// Bulk-Only Mass Storage Reset
    pub const BULK_ONLY_RESET: u8 = 0xFF;
}

// ============================================================================
// USB Communication Trait
// ============================================================================

/// USB transfer error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Operation timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (pipe error)
    #[error("endpoint stalled")]
    Stall,
    /// Fewer bytes than required moved on a fixed-size transfer
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,
    /// Device disconnected or communication channel closed
    #[error("device disconnected")]
    Disconnected,
}

/// Raw endpoint access to one USB mass-storage interface
///
/// Implementations perform exactly one transfer per call and return the
/// number of bytes moved. They need no internal locking: the Bulk-Only
/// driver serializes every call behind its own transport lock.
pub trait UsbCommunication: Send {
    /// Perform a bulk OUT transfer
    ///
    /// # Returns
    /// Number of bytes written on success
    fn bulk_out_transfer(&mut self, data: &[u8]) -> Result<usize, UsbError>;

    /// Perform a bulk IN transfer
    ///
    /// # Returns
    /// Number of bytes read on success (may be less than `data.len()`)
    fn bulk_in_transfer(&mut self, data: &mut [u8]) -> Result<usize, UsbError>;

    /// Perform a control transfer on the default pipe
    ///
    /// # Arguments
    /// * `request_type` - Request type byte (direction, type, recipient)
    /// * `request` - Request code
    /// * `value` - wValue field
    /// * `index` - wIndex field
    /// * `data` - Optional data stage buffer
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Option<&mut [u8]>,
    ) -> Result<usize, UsbError>;

    /// Interface number of the mass-storage interface (wIndex for class requests)
    fn interface_number(&self) -> u8;

    /// Bulk IN endpoint address (direction bit set)
    fn bulk_in_address(&self) -> u8;

    /// Bulk OUT endpoint address
    fn bulk_out_address(&self) -> u8;

    /// Clear a stalled endpoint by sending CLEAR_FEATURE(ENDPOINT_HALT).
    fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbError> {
        self.control_transfer(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_ENDPOINT,
            request::CLEAR_FEATURE,
            request::ENDPOINT_HALT,
            endpoint as u16,
            None,
        )
        .map(|_| ())
    }
}
