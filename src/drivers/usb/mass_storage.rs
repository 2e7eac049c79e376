//! USB Mass Storage Class driver (Bulk-Only Transport)
//!
//! This module implements the USB Mass Storage Class Bulk-Only Transport (BBB)
//! protocol with the SCSI transparent command set, for reading and writing
//! USB flash drives from user space.
//!
//! The driver works with any platform that implements the `UsbCommunication`
//! trait. Every CBW/data/CSW exchange runs under one transport lock, so a
//! `UsbMassStorage` can be shared between threads as a `BlockDevice`.
//!
//! # Error recovery
//!
//! - Phase errors, malformed CSWs and tag mismatches trigger Reset Recovery
//!   (class reset, then clear halt on bulk-IN and bulk-OUT) before a retry
//! - A stalled data endpoint is cleared and the CSW is still collected
//! - Other transfer errors pause briefly and retry with a fresh tag
//! - All of the above is bounded by `TransportConfig::max_attempts` and
//!   `TransportConfig::max_elapsed_ms`

use super::controller::{msc_request, req_type, UsbCommunication, UsbError};
use super::scsi::{
    self, CommandBlock, Direction, InquiryResponse, ReadCapacity10Response, SenseClass, SenseData,
};
use crate::drivers::block::{BlockDevice, BlockDeviceInfo, BlockError};
use crate::time::{self, Timeout};
use spin::Mutex;
use thiserror::Error;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Command Block Wrapper (CBW) - 31 bytes
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
pub struct CommandBlockWrapper {
    /// Signature (0x43425355 = "USBC")
    pub signature: U32,
    /// Tag (echoed in CSW)
    pub tag: U32,
    /// Data Transfer Length
    pub data_transfer_length: U32,
    /// Flags (bit 7: direction - 0=OUT, 1=IN)
    pub flags: u8,
    /// LUN (bits 0-3)
    pub lun: u8,
    /// Command Block Length (1-16)
    pub cb_length: u8,
    /// Command Block (SCSI CDB)
    pub cb: [u8; 16],
}

/// Command Status Wrapper (CSW) - 13 bytes
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
pub struct CommandStatusWrapper {
    /// Signature (0x53425355 = "USBS")
    pub signature: U32,
    /// Tag (same as CBW)
    pub tag: U32,
    /// Data Residue
    pub data_residue: U32,
    /// Status (0=passed, 1=failed, 2=phase error)
    pub status: u8,
}

/// CBW Signature
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// CSW Signature
pub const CSW_SIGNATURE: u32 = 0x53425355;
/// Size of a CBW on the wire
pub const CBW_LENGTH: usize = 31;
/// Size of a CSW on the wire
pub const CSW_LENGTH: usize = 13;

/// CBW flag for a device-to-host data phase
const CBW_FLAG_DATA_IN: u8 = 0x80;

/// CSW Status values
pub mod csw_status {
    pub const PASSED: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const PHASE_ERROR: u8 = 2;
}

/// How many times init re-issues a command that reported UNIT ATTENTION
const INIT_COMMAND_TRIES: u32 = 3;

impl CommandBlockWrapper {
    /// Frame `command` under `tag`
    pub fn new(tag: u32, command: &CommandBlock) -> Self {
        Self {
            signature: U32::new(CBW_SIGNATURE),
            tag: U32::new(tag),
            data_transfer_length: U32::new(command.transfer_length()),
            flags: if command.direction() == Direction::In {
                CBW_FLAG_DATA_IN
            } else {
                0
            },
            lun: command.lun() & 0x0F,
            cb_length: command.cdb().len() as u8,
            cb: command.cdb_field(),
        }
    }
}

/// Mass Storage Error
#[derive(Debug, Error)]
pub enum MassStorageError {
    /// USB transfer error
    #[error("USB transfer failed: {0}")]
    Usb(#[from] UsbError),
    /// CSW too short or with a bad signature
    #[error("invalid command status wrapper")]
    InvalidCsw,
    /// CSW answered a different CBW
    #[error("CSW tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: u32, actual: u32 },
    /// Command failed and the device explained why
    #[error("command {opcode:#04x} failed: {sense}")]
    CommandFailed { opcode: u8, sense: SenseData },
    /// Command failed and REQUEST SENSE gave nothing usable
    #[error("command {opcode:#04x} failed without sense data")]
    CommandFailedNoSense { opcode: u8 },
    /// Phase error
    #[error("phase error, please reattach device and try again")]
    PhaseError,
    /// Peripheral is not a direct-access block device
    #[error("unsupported peripheral device type {0:#04x}")]
    UnsupportedDevice(u8),
    /// Device not ready
    #[error("device not ready")]
    NotReady,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,
    /// Retry budget spent; the device is wedged or gone
    #[error("recovery failed after {attempts} attempts in {elapsed_ms} ms, re-attach device")]
    RecoveryExhausted {
        attempts: u32,
        elapsed_ms: u64,
        source: Box<MassStorageError>,
    },
}

impl MassStorageError {
    /// True when retrying can never help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MassStorageError::Usb(UsbError::Disconnected)
                | MassStorageError::RecoveryExhausted { .. }
                | MassStorageError::UnsupportedDevice(_)
        )
    }
}

/// Transport tuning
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    /// Logical unit to address
    pub lun: u8,
    /// Upper bound on attempts per command, recovery included
    pub max_attempts: u32,
    /// Upper bound on wall-clock time per command
    pub max_elapsed_ms: u64,
    /// Pause before retrying after a transfer error, and after a class reset
    pub retry_delay_ms: u64,
    /// How many times the INQUIRY / TEST UNIT READY / READ CAPACITY sequence runs
    pub init_attempts: u32,
    /// Largest single bulk transfer, and largest READ(10)/WRITE(10)
    pub max_transfer_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            lun: 0,
            max_attempts: 20,
            max_elapsed_ms: 10_000,
            retry_delay_ms: 100,
            init_attempts: 2,
            max_transfer_bytes: 64 * 1024,
        }
    }
}

/// Buffer for the data phase of one command
pub enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataPhase<'_> {
    fn direction(&self) -> Direction {
        match self {
            DataPhase::None => Direction::None,
            DataPhase::In(_) => Direction::In,
            DataPhase::Out(_) => Direction::Out,
        }
    }

    fn len(&self) -> usize {
        match self {
            DataPhase::None => 0,
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
        }
    }
}

/// What went wrong in one exchange, and how to get back in sync
#[derive(Debug)]
enum Fault {
    /// Pause and re-issue
    Retry(MassStorageError),
    /// Reset Recovery, then re-issue
    Reset(MassStorageError),
}

impl Fault {
    fn error(&self) -> &MassStorageError {
        match self {
            Fault::Retry(e) | Fault::Reset(e) => e,
        }
    }

    fn into_error(self) -> MassStorageError {
        match self {
            Fault::Retry(e) | Fault::Reset(e) => e,
        }
    }
}

/// Result of one exchange that reached a valid CSW
enum Completion {
    Passed,
    /// Failed with a sense key that only asks for the command again
    Retry(SenseData),
    Failed(MassStorageError),
}

/// The bulk pipe and its tag counter; only ever used under the transport lock
struct Transport {
    comm: Box<dyn UsbCommunication>,
    tag: u32,
    max_transfer: usize,
    reset_delay_ms: u64,
}

impl Transport {
    /// Get next tag
    fn next_tag(&mut self) -> u32 {
        let tag = self.tag;
        self.tag = self.tag.wrapping_add(1);
        tag
    }

    /// Perform a Bulk-Only Transport (BOT) Reset Recovery.
    ///
    /// 1. Send class-specific Bulk-Only Mass Storage Reset (bRequest=0xFF)
    /// 2. Clear HALT on Bulk-In endpoint
    /// 3. Clear HALT on Bulk-Out endpoint
    fn reset_recovery(&mut self) {
        log::debug!("USB BOT: Performing reset recovery");

        let interface = self.comm.interface_number() as u16;
        if let Err(e) = self.comm.control_transfer(
            req_type::DIR_OUT | req_type::TYPE_CLASS | req_type::RCPT_INTERFACE,
            msc_request::BULK_ONLY_RESET,
            0,
            interface,
            None,
        ) {
            log::warn!("USB BOT: Mass Storage Reset request failed: {}", e);
        }

        if self.reset_delay_ms > 0 {
            time::delay_ms(self.reset_delay_ms);
        }

        let bulk_in = self.comm.bulk_in_address();
        if let Err(e) = self.comm.clear_halt(bulk_in) {
            log::warn!("USB BOT: Clear Bulk-In halt failed: {}", e);
        }
        let bulk_out = self.comm.bulk_out_address();
        if let Err(e) = self.comm.clear_halt(bulk_out) {
            log::warn!("USB BOT: Clear Bulk-Out halt failed: {}", e);
        }

        log::debug!("USB BOT: Reset recovery complete");
    }

    fn clear_endpoint_halt(&mut self, endpoint: u8) -> Result<(), Fault> {
        log::debug!("USB BOT: Clearing halt on endpoint {:#x}", endpoint);
        self.comm
            .clear_halt(endpoint)
            .map_err(|e| Fault::Reset(MassStorageError::Usb(e)))
    }

    /// Pull the IN data phase, following a length announced mid-response
    fn read_data(&mut self, command: &CommandBlock, buf: &mut [u8]) -> Result<usize, UsbError> {
        let mut expected = buf.len();
        let mut received = 0;
        while received < expected {
            let end = (received + self.max_transfer).min(expected);
            let n = self.comm.bulk_in_transfer(&mut buf[received..end])?;
            if n == 0 {
                break;
            }
            received += n;
            if let Some(announced) = command.dynamic_transfer_length(&buf[..received]) {
                expected = announced.max(received).min(expected);
            }
        }
        Ok(received)
    }

    /// Push the OUT data phase
    fn write_data(&mut self, buf: &[u8]) -> Result<usize, UsbError> {
        let mut sent = 0;
        while sent < buf.len() {
            let end = (sent + self.max_transfer).min(buf.len());
            let n = self.comm.bulk_out_transfer(&buf[sent..end])?;
            if n == 0 {
                break;
            }
            sent += n;
        }
        Ok(sent)
    }

    /// One CBW -> data -> CSW exchange. Returns the CSW status byte.
    fn transfer_once(
        &mut self,
        command: &CommandBlock,
        data: &mut DataPhase<'_>,
    ) -> Result<u8, Fault> {
        let tag = self.next_tag();
        let cbw = CommandBlockWrapper::new(tag, command);

        log::trace!(
            "USB SCSI: cmd={:#04x} tag={} len={} dir={:?}",
            command.opcode(),
            tag,
            command.transfer_length(),
            command.direction()
        );

        // Phase 1: Send CBW (OUT)
        match self.comm.bulk_out_transfer(cbw.as_bytes()) {
            Ok(CBW_LENGTH) => {}
            Ok(n) => {
                return Err(Fault::Reset(MassStorageError::Usb(UsbError::ShortTransfer {
                    expected: CBW_LENGTH,
                    actual: n,
                })))
            }
            // A stall on the CBW means the device rejected it outright
            Err(UsbError::Stall) => return Err(Fault::Reset(UsbError::Stall.into())),
            Err(e) => return Err(Fault::Retry(e.into())),
        }

        // Phase 2: Data transfer (if any). A stalled endpoint is cleared and
        // the CSW is still collected.
        let data_result = match data {
            DataPhase::None => Ok(0),
            DataPhase::In(buf) => self.read_data(command, buf),
            DataPhase::Out(buf) => self.write_data(buf),
        };
        let transferred = match data_result {
            Ok(n) => n,
            Err(UsbError::Stall) => {
                let endpoint = if command.direction() == Direction::In {
                    self.comm.bulk_in_address()
                } else {
                    self.comm.bulk_out_address()
                };
                log::debug!("USB SCSI: Data phase stalled");
                self.clear_endpoint_halt(endpoint)?;
                0
            }
            Err(UsbError::Timeout) => {
                log::debug!("USB SCSI: Data phase timed out");
                return Err(Fault::Reset(UsbError::Timeout.into()));
            }
            Err(e) => return Err(Fault::Retry(e.into())),
        };

        // Phase 3: Receive CSW (IN)
        let mut csw_buf = [0u8; CSW_LENGTH];
        let received = match self.comm.bulk_in_transfer(&mut csw_buf) {
            Ok(n) => n,
            Err(UsbError::Stall) => {
                let bulk_in = self.comm.bulk_in_address();
                self.clear_endpoint_halt(bulk_in)?;
                self.comm
                    .bulk_in_transfer(&mut csw_buf)
                    .map_err(|e| Fault::Reset(e.into()))?
            }
            Err(UsbError::Disconnected) => return Err(Fault::Retry(UsbError::Disconnected.into())),
            Err(e) => {
                log::debug!("USB SCSI: CSW transfer failed: {}", e);
                return Err(Fault::Reset(e.into()));
            }
        };

        let csw = match CommandStatusWrapper::read_from_bytes(&csw_buf[..received]) {
            Ok(csw) if csw.signature.get() == CSW_SIGNATURE => csw,
            _ => {
                log::debug!("USB SCSI: Invalid CSW ({} bytes)", received);
                return Err(Fault::Reset(MassStorageError::InvalidCsw));
            }
        };

        log::trace!(
            "USB SCSI: CSW tag={} residue={} status={}",
            csw.tag.get(),
            csw.data_residue.get(),
            csw.status
        );

        if csw.tag.get() != tag {
            log::debug!(
                "USB SCSI: CSW tag mismatch: got {} expected {}",
                csw.tag.get(),
                tag
            );
            return Err(Fault::Reset(MassStorageError::TagMismatch {
                expected: tag,
                actual: csw.tag.get(),
            }));
        }

        match csw.status {
            csw_status::PASSED => {
                let expected = command.transfer_length() as usize;
                if command.requires_full_transfer() && transferred < expected {
                    return Err(Fault::Retry(
                        UsbError::ShortTransfer {
                            expected,
                            actual: transferred,
                        }
                        .into(),
                    ));
                }
                Ok(csw_status::PASSED)
            }
            csw_status::FAILED => Ok(csw_status::FAILED),
            csw_status::PHASE_ERROR => {
                log::debug!("USB SCSI: Phase error for command {:#04x}", command.opcode());
                Err(Fault::Reset(MassStorageError::PhaseError))
            }
            other => {
                log::debug!("USB SCSI: Unknown CSW status {}", other);
                Err(Fault::Reset(MassStorageError::InvalidCsw))
            }
        }
    }

    /// Fetch sense data after a failed command
    fn request_sense(&mut self, lun: u8) -> Result<Option<SenseData>, Fault> {
        let command = CommandBlock::request_sense(lun);
        let mut buf = [0u8; scsi::REQUEST_SENSE_LENGTH as usize];
        let status = self.transfer_once(&command, &mut DataPhase::In(&mut buf))?;
        if status != csw_status::PASSED {
            return Ok(None);
        }
        Ok(SenseData::parse(&buf))
    }

    fn attempt(
        &mut self,
        command: &CommandBlock,
        data: &mut DataPhase<'_>,
    ) -> Result<Completion, Fault> {
        if self.transfer_once(command, data)? == csw_status::PASSED {
            return Ok(Completion::Passed);
        }

        let opcode = command.opcode();
        log::debug!("USB SCSI: Command {:#04x} failed (CSW status=1)", opcode);
        let completion = match self.request_sense(command.lun())? {
            Some(sense) => match sense.classify() {
                SenseClass::Recovered => {
                    log::debug!("USB SCSI: Command {:#04x} recovered: {}", opcode, sense);
                    Completion::Passed
                }
                SenseClass::Retry => Completion::Retry(sense),
                SenseClass::Error => Completion::Failed(MassStorageError::CommandFailed {
                    opcode,
                    sense,
                }),
            },
            None => Completion::Failed(MassStorageError::CommandFailedNoSense { opcode }),
        };
        Ok(completion)
    }
}

/// USB Mass Storage Device
///
/// Each Bulk-Only exchange runs start to finish under the `transport` spin
/// lock, including reset recovery and its settle delay. Other callers spin
/// for that long. Retry pauses between attempts drop the lock.
pub struct UsbMassStorage {
    transport: Mutex<Transport>,
    config: TransportConfig,
    info: BlockDeviceInfo,
    vendor: String,
    product: String,
}

impl UsbMassStorage {
    /// Bind to a claimed mass-storage interface and run device init
    ///
    /// Init is INQUIRY, a peripheral type check, TEST UNIT READY and
    /// READ CAPACITY(10); the whole sequence is retried
    /// `config.init_attempts` times since drives are often slow to wake.
    pub fn new(
        comm: Box<dyn UsbCommunication>,
        config: TransportConfig,
    ) -> Result<Self, MassStorageError> {
        log::debug!(
            "USB Mass Storage: init interface={} bulk_in={:#x} bulk_out={:#x}",
            comm.interface_number(),
            comm.bulk_in_address(),
            comm.bulk_out_address()
        );

        let mut device = Self {
            transport: Mutex::new(Transport {
                comm,
                tag: 1,
                max_transfer: config.max_transfer_bytes.max(1),
                reset_delay_ms: config.retry_delay_ms,
            }),
            config,
            info: BlockDeviceInfo {
                num_blocks: 0,
                block_size: 512,
                removable: true,
                read_only: false,
            },
            vendor: String::new(),
            product: String::new(),
        };

        let attempts = config.init_attempts.max(1);
        let mut attempt = 1;
        loop {
            match device.init() {
                Ok(()) => break,
                Err(e) if e.is_fatal() || attempt >= attempts => {
                    log::error!("USB Mass Storage: init failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!(
                        "USB Mass Storage: init attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    time::delay_ms(config.retry_delay_ms);
                    attempt += 1;
                }
            }
        }

        log::info!(
            "USB Mass Storage: {} {} - {} blocks x {} bytes = {} MB",
            device.vendor,
            device.product,
            device.info.num_blocks,
            device.info.block_size,
            (device.info.num_blocks * device.info.block_size as u64) / (1024 * 1024)
        );

        Ok(device)
    }

    fn init(&mut self) -> Result<(), MassStorageError> {
        let lun = self.config.lun;

        let mut response = [0u8; scsi::INQUIRY_LENGTH as usize];
        self.execute_until_passed(
            &CommandBlock::inquiry(lun),
            DataPhase::In(&mut response),
            INIT_COMMAND_TRIES,
        )?;
        let inquiry = InquiryResponse::read_from_bytes(&response)
            .map_err(|_| MassStorageError::InvalidParameter)?;
        if inquiry.peripheral_type() != scsi::PERIPHERAL_DIRECT_ACCESS {
            return Err(MassStorageError::UnsupportedDevice(inquiry.peripheral_type()));
        }
        self.vendor = String::from_utf8_lossy(&inquiry.vendor).trim().to_string();
        self.product = String::from_utf8_lossy(&inquiry.product).trim().to_string();
        self.info.removable = inquiry.is_removable();

        self.execute_until_passed(
            &CommandBlock::test_unit_ready(lun),
            DataPhase::None,
            INIT_COMMAND_TRIES,
        )?;

        let mut response = [0u8; scsi::READ_CAPACITY_10_LENGTH as usize];
        self.execute_until_passed(
            &CommandBlock::read_capacity(lun),
            DataPhase::In(&mut response),
            INIT_COMMAND_TRIES,
        )?;
        let cap = ReadCapacity10Response::read_from_bytes(&response)
            .map_err(|_| MassStorageError::InvalidParameter)?;

        let block_size = cap.block_length.get();
        if block_size == 0 || !block_size.is_power_of_two() {
            log::warn!("USB Mass Storage: bogus block length {}", block_size);
            return Err(MassStorageError::InvalidParameter);
        }
        let last_lba = cap.last_lba.get();
        if last_lba == u32::MAX {
            // READ(10) cannot address beyond this anyway
            log::warn!("USB Mass Storage: capacity exceeds READ(10) range, truncating");
        }
        self.info.num_blocks = last_lba as u64 + 1;
        self.info.block_size = block_size;

        Ok(())
    }

    /// Execute one SCSI command end-to-end, including error recovery.
    ///
    /// Returns `Ok(true)` when the command passed and `Ok(false)` when the
    /// device failed it with UNIT ATTENTION or NO SENSE, which callers
    /// answer by issuing the command again. Other failures are errors.
    pub fn execute(
        &self,
        command: &CommandBlock,
        mut data: DataPhase<'_>,
    ) -> Result<bool, MassStorageError> {
        self.execute_with(command, &mut data)
    }

    fn execute_with(
        &self,
        command: &CommandBlock,
        data: &mut DataPhase<'_>,
    ) -> Result<bool, MassStorageError> {
        if data.direction() != command.direction()
            || data.len() != command.transfer_length() as usize
        {
            return Err(MassStorageError::InvalidParameter);
        }

        let mut transport = self.transport.lock();
        let timeout = Timeout::from_ms(self.config.max_elapsed_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let fault = match transport.attempt(command, data) {
                Ok(Completion::Passed) => return Ok(true),
                Ok(Completion::Retry(sense)) => {
                    log::warn!(
                        "USB SCSI: Command {:#04x} reported {}, ignoring",
                        command.opcode(),
                        sense
                    );
                    return Ok(false);
                }
                Ok(Completion::Failed(e)) => return Err(e),
                Err(fault) => fault,
            };

            if matches!(fault.error(), MassStorageError::Usb(UsbError::Disconnected)) {
                log::error!("USB Mass Storage: device disconnected");
                return Err(fault.into_error());
            }

            log::debug!(
                "USB SCSI: Command {:#04x} attempt {} failed: {}",
                command.opcode(),
                attempts,
                fault.error()
            );

            match fault {
                Fault::Reset(_) => transport.reset_recovery(),
                Fault::Retry(_) => {
                    if attempts < self.config.max_attempts && self.config.retry_delay_ms > 0 {
                        drop(transport);
                        time::delay_ms(self.config.retry_delay_ms);
                        transport = self.transport.lock();
                    }
                }
            }

            if attempts >= self.config.max_attempts || timeout.is_expired() {
                let elapsed_ms = timeout.elapsed_ms();
                log::error!(
                    "USB Mass Storage: giving up on command {:#04x} after {} attempts ({} ms)",
                    command.opcode(),
                    attempts,
                    elapsed_ms
                );
                return Err(MassStorageError::RecoveryExhausted {
                    attempts,
                    elapsed_ms,
                    source: Box::new(fault.into_error()),
                });
            }
        }
    }

    /// Re-issue a command while the device keeps answering with UNIT ATTENTION
    fn execute_until_passed(
        &self,
        command: &CommandBlock,
        mut data: DataPhase<'_>,
        tries: u32,
    ) -> Result<(), MassStorageError> {
        for _ in 0..tries.max(1) {
            if self.execute_with(command, &mut data)? {
                return Ok(());
            }
        }
        Err(MassStorageError::NotReady)
    }

    /// Vendor identification from INQUIRY
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Product identification from INQUIRY
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Blocks per READ(10)/WRITE(10)
    fn max_blocks_per_command(&self) -> usize {
        let block_size = self.info.block_size as usize;
        (self.config.max_transfer_bytes / block_size).clamp(1, u16::MAX as usize)
    }

    fn check_range(&self, lba: u64, len: usize) -> Result<u64, BlockError> {
        let block_size = self.info.block_size as usize;
        if len % block_size != 0 {
            return Err(BlockError::InvalidParameter);
        }
        let count = (len / block_size) as u64;
        match lba.checked_add(count) {
            Some(end) if end <= self.info.num_blocks => Ok(count),
            _ => Err(BlockError::OutOfRange),
        }
    }
}

impl BlockDevice for UsbMassStorage {
    fn info(&self) -> BlockDeviceInfo {
        self.info
    }

    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.check_range(lba, buffer.len())?;
        let block_size = self.info.block_size as usize;
        let per_command = self.max_blocks_per_command();

        for (i, chunk) in buffer.chunks_mut(per_command * block_size).enumerate() {
            let start = lba + (i * per_command) as u64;
            let start = u32::try_from(start).map_err(|_| BlockError::OutOfRange)?;
            let blocks = (chunk.len() / block_size) as u16;
            let command = CommandBlock::read10(self.config.lun, start, blocks, block_size as u32);
            self.execute_until_passed(&command, DataPhase::In(chunk), self.config.max_attempts)?;
        }
        Ok(())
    }

    fn write_blocks(&self, lba: u64, buffer: &[u8]) -> Result<(), BlockError> {
        if self.info.read_only {
            return Err(BlockError::ReadOnly);
        }
        self.check_range(lba, buffer.len())?;
        let block_size = self.info.block_size as usize;
        let per_command = self.max_blocks_per_command();

        for (i, chunk) in buffer.chunks(per_command * block_size).enumerate() {
            let start = lba + (i * per_command) as u64;
            let start = u32::try_from(start).map_err(|_| BlockError::OutOfRange)?;
            let blocks = (chunk.len() / block_size) as u16;
            let command = CommandBlock::write10(self.config.lun, start, blocks, block_size as u32);
            self.execute_until_passed(&command, DataPhase::Out(chunk), self.config.max_attempts)?;
        }
        Ok(())
    }
}
