//! SCSI transparent command set
//!
//! Command descriptor blocks for the handful of commands a USB flash drive
//! needs, plus parsers for their responses. Multi-byte CDB fields and
//! response fields are big-endian.

use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// SCSI Commands
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
}

/// Allocation length used for INQUIRY
pub const INQUIRY_LENGTH: u32 = 36;
/// Allocation length used for REQUEST SENSE (fixed format)
pub const REQUEST_SENSE_LENGTH: u32 = 18;
/// READ CAPACITY(10) response length
pub const READ_CAPACITY_10_LENGTH: u32 = 8;

/// Peripheral device type of a direct-access block device
pub const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00;

/// Data phase direction of a command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
    /// No data phase
    None,
}

/// One SCSI command, ready to be framed into a CBW
#[derive(Clone, Copy, Debug)]
pub struct CommandBlock {
    cdb: [u8; 16],
    cdb_length: u8,
    direction: Direction,
    transfer_length: u32,
    lun: u8,
}

impl CommandBlock {
    fn new(cdb: &[u8], direction: Direction, transfer_length: u32, lun: u8) -> Self {
        let mut block = [0u8; 16];
        let len = cdb.len().min(16);
        block[..len].copy_from_slice(&cdb[..len]);
        Self {
            cdb: block,
            cdb_length: len as u8,
            direction,
            transfer_length,
            lun,
        }
    }

    /// TEST UNIT READY
    pub fn test_unit_ready(lun: u8) -> Self {
        Self::new(&[opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0], Direction::None, 0, lun)
    }

    /// INQUIRY, standard data
    pub fn inquiry(lun: u8) -> Self {
        Self::new(
            &[opcode::INQUIRY, 0, 0, 0, INQUIRY_LENGTH as u8, 0],
            Direction::In,
            INQUIRY_LENGTH,
            lun,
        )
    }

    /// REQUEST SENSE, fixed format
    pub fn request_sense(lun: u8) -> Self {
        Self::new(
            &[opcode::REQUEST_SENSE, 0, 0, 0, REQUEST_SENSE_LENGTH as u8, 0],
            Direction::In,
            REQUEST_SENSE_LENGTH,
            lun,
        )
    }

    /// READ CAPACITY(10)
    pub fn read_capacity(lun: u8) -> Self {
        Self::new(
            &[opcode::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            Direction::In,
            READ_CAPACITY_10_LENGTH,
            lun,
        )
    }

    /// READ(10) of `blocks` blocks starting at `lba`
    pub fn read10(lun: u8, lba: u32, blocks: u16, block_size: u32) -> Self {
        Self::new(
            &Self::rw10_cdb(opcode::READ_10, lba, blocks),
            Direction::In,
            blocks as u32 * block_size,
            lun,
        )
    }

    /// WRITE(10) of `blocks` blocks starting at `lba`
    pub fn write10(lun: u8, lba: u32, blocks: u16, block_size: u32) -> Self {
        Self::new(
            &Self::rw10_cdb(opcode::WRITE_10, lba, blocks),
            Direction::Out,
            blocks as u32 * block_size,
            lun,
        )
    }

    fn rw10_cdb(op: u8, lba: u32, blocks: u16) -> [u8; 10] {
        let lba_bytes = lba.to_be_bytes();
        let count_bytes = blocks.to_be_bytes();
        [
            op,
            0,
            lba_bytes[0],
            lba_bytes[1],
            lba_bytes[2],
            lba_bytes[3],
            0,
            count_bytes[0],
            count_bytes[1],
            0,
        ]
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Expected number of bytes in the data phase
    pub fn transfer_length(&self) -> u32 {
        self.transfer_length
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// The valid CDB bytes
    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_length as usize]
    }

    /// Full 16-byte CDB field as it appears in the CBW
    pub fn cdb_field(&self) -> [u8; 16] {
        self.cdb
    }

    /// Whether a data phase shorter than `transfer_length` is an error
    pub fn requires_full_transfer(&self) -> bool {
        matches!(
            self.opcode(),
            opcode::READ_10 | opcode::WRITE_10 | opcode::READ_CAPACITY_10
        )
    }

    /// Length discovered from a partial response, if this command has one.
    ///
    /// REQUEST SENSE announces how much data follows in byte 7
    /// (additional sense length); the device sends no more than that.
    pub fn dynamic_transfer_length(&self, received: &[u8]) -> Option<usize> {
        if self.opcode() != opcode::REQUEST_SENSE || received.len() < 8 {
            return None;
        }
        let announced = 8 + received[7] as usize;
        Some(announced.min(self.transfer_length as usize))
    }
}

/// SCSI Inquiry Response
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
pub struct InquiryResponse {
    /// Peripheral device type (bits 0-4), qualifier (bits 5-7)
    pub peripheral: u8,
    /// RMB (bit 7)
    pub rmb: u8,
    /// Version
    pub version: u8,
    /// Response data format (bits 0-3), HiSup (bit 4), NormACA (bit 5)
    pub format: u8,
    /// Additional length
    pub additional_length: u8,
    /// SCCS, ACC, TPGS, 3PC, Reserved, Protect
    pub flags1: u8,
    /// Reserved, EncServ, VS, MultiP, MChngr, Reserved, Addr16
    pub flags2: u8,
    /// Reserved, WBus16, Sync, Linked, Reserved, CmdQue, VS
    pub flags3: u8,
    /// Vendor ID (8 bytes)
    pub vendor: [u8; 8],
    /// Product ID (16 bytes)
    pub product: [u8; 16],
    /// Product Revision (4 bytes)
    pub revision: [u8; 4],
}

impl InquiryResponse {
    pub fn peripheral_type(&self) -> u8 {
        self.peripheral & 0x1F
    }

    pub fn is_removable(&self) -> bool {
        self.rmb & 0x80 != 0
    }
}

/// Read Capacity 10 Response
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
pub struct ReadCapacity10Response {
    /// Last Logical Block Address
    pub last_lba: big_endian::U32,
    /// Block Length
    pub block_length: big_endian::U32,
}

/// Sense keys (SPC-4, table 48)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    AbortedCommand,
    Other(u8),
}

impl From<u8> for SenseKey {
    fn from(key: u8) -> Self {
        match key & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0xB => SenseKey::AbortedCommand,
            other => SenseKey::Other(other),
        }
    }
}

/// How the transport should treat a failed command after REQUEST SENSE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenseClass {
    /// Completed after device-side recovery; the data is valid
    Recovered,
    /// Media changed, device reset, or no sense reported; re-issue the command
    Retry,
    /// Surface to the caller
    Error,
}

/// Decoded fixed-format sense data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenseData {
    pub key: SenseKey,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl SenseData {
    /// Parse fixed-format (0x70/0x71) sense data
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let response_code = data[0] & 0x7F;
        if response_code != 0x70 && response_code != 0x71 {
            return None;
        }
        Some(Self {
            key: SenseKey::from(data[2]),
            asc: data.get(12).copied().unwrap_or(0),
            ascq: data.get(13).copied().unwrap_or(0),
        })
    }

    pub fn classify(&self) -> SenseClass {
        match self.key {
            SenseKey::RecoveredError => SenseClass::Recovered,
            SenseKey::NoSense | SenseKey::UnitAttention => SenseClass::Retry,
            _ => SenseClass::Error,
        }
    }
}

impl core::fmt::Display for SenseData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "sense key {:?}, ASC {:#04x}, ASCQ {:#04x}",
            self.key, self.asc, self.ascq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read10_cdb_layout() {
        let cmd = CommandBlock::read10(0, 0x0102_0304, 0x0506, 512);
        assert_eq!(
            cmd.cdb(),
            &[0x28, 0, 0x01, 0x02, 0x03, 0x04, 0, 0x05, 0x06, 0]
        );
        assert_eq!(cmd.transfer_length(), 0x0506 * 512);
        assert_eq!(cmd.direction(), Direction::In);
        assert_eq!(CommandBlock::write10(0, 1, 1, 512).direction(), Direction::Out);
    }

    #[test]
    fn test_request_sense_dynamic_length() {
        let cmd = CommandBlock::request_sense(0);
        let mut partial = [0u8; 8];
        partial[0] = 0x70;
        partial[7] = 6;
        assert_eq!(cmd.dynamic_transfer_length(&partial), Some(14));
        partial[7] = 200;
        assert_eq!(cmd.dynamic_transfer_length(&partial), Some(18));
        assert_eq!(cmd.dynamic_transfer_length(&partial[..4]), None);
        assert_eq!(CommandBlock::inquiry(0).dynamic_transfer_length(&partial), None);
    }

    #[test]
    fn test_sense_classification() {
        let mut raw = [0u8; 18];
        raw[0] = 0x70;
        raw[2] = 0x06;
        raw[12] = 0x28;
        let sense = SenseData::parse(&raw).unwrap();
        assert_eq!(sense.key, SenseKey::UnitAttention);
        assert_eq!(sense.asc, 0x28);
        assert_eq!(sense.classify(), SenseClass::Retry);

        raw[2] = 0x03;
        assert_eq!(SenseData::parse(&raw).unwrap().classify(), SenseClass::Error);
        raw[2] = 0x01;
        assert_eq!(SenseData::parse(&raw).unwrap().classify(), SenseClass::Recovered);
        raw[2] = 0x00;
        assert_eq!(SenseData::parse(&raw).unwrap().classify(), SenseClass::Retry);

        raw[0] = 0x72;
        assert!(SenseData::parse(&raw).is_none());
    }

    #[test]
    fn test_read_capacity_is_big_endian() {
        let raw = [0x00, 0x00, 0x0F, 0xFF, 0x00, 0x00, 0x02, 0x00];
        let cap = ReadCapacity10Response::read_from_bytes(&raw).unwrap();
        assert_eq!(cap.last_lba.get(), 0xFFF);
        assert_eq!(cap.block_length.get(), 512);
    }
}
