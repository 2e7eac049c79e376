//! Test doubles
//!
//! - `MemoryBlockDevice`: a RAM disk counting block reads and writes
//! - `FakeUsbDrive`: a scripted Bulk-Only drive behind `UsbCommunication`
//! - `format_fat32` / `mbr_wrap`: minimal volume images

use crate::drivers::block::{BlockDevice, BlockDeviceInfo, BlockError};
use crate::drivers::usb::controller::{msc_request, req_type, request, UsbCommunication, UsbError};
use crate::drivers::usb::mass_storage::{
    CommandBlockWrapper, CommandStatusWrapper, CBW_SIGNATURE, CSW_LENGTH, CSW_SIGNATURE,
};
use crate::drivers::usb::scsi::{opcode, InquiryResponse, ReadCapacity10Response};
use crate::fs::fat::boot_sector::{RawBootSector, FAT32_SIGNATURE};
use crate::fs::fat::entry::{ATTR_VOLUME_ID, DIR_ENTRY_SIZE};
use crate::fs::fat::fs_info::RawFsInfo;
use crate::fs::partition::MbrPartitionEntry;
use spin::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use zerocopy::byteorder::{big_endian, little_endian};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

// ============================================================================
// RAM disk
// ============================================================================

type WriteHook = Box<dyn FnMut() + Send>;

pub struct MemoryBlockDevice {
    data: Mutex<Vec<u8>>,
    block_size: u32,
    reads: AtomicUsize,
    writes: AtomicUsize,
    read_only: AtomicBool,
    on_write: Mutex<Option<WriteHook>>,
}

impl MemoryBlockDevice {
    pub fn new(num_blocks: u64, block_size: u32) -> Self {
        Self::from_image(vec![0u8; (num_blocks * block_size as u64) as usize], block_size)
    }

    pub fn from_image(image: Vec<u8>, block_size: u32) -> Self {
        assert_eq!(image.len() % block_size as usize, 0);
        Self {
            data: Mutex::new(image),
            block_size,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
            on_write: Mutex::new(None),
        }
    }

    /// `read_blocks` calls so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// `write_blocks` calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Reject writes with `ReadOnly` while set
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Run `hook` after every successful `write_blocks`
    pub fn set_write_hook(&self, hook: impl FnMut() + Send + 'static) {
        *self.on_write.lock() = Some(Box::new(hook));
    }

    fn range(&self, lba: u64, len: usize, total: usize) -> Result<core::ops::Range<usize>, BlockError> {
        if len % self.block_size as usize != 0 {
            return Err(BlockError::InvalidParameter);
        }
        let start = lba as usize * self.block_size as usize;
        match start.checked_add(len) {
            Some(end) if end <= total => Ok(start..end),
            _ => Err(BlockError::OutOfRange),
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            num_blocks: (self.data.lock().len() / self.block_size as usize) as u64,
            block_size: self.block_size,
            removable: true,
            read_only: self.read_only.load(Ordering::SeqCst),
        }
    }

    fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        let data = self.data.lock();
        let range = self.range(lba, buffer.len(), data.len())?;
        buffer.copy_from_slice(&data[range]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_blocks(&self, lba: u64, buffer: &[u8]) -> Result<(), BlockError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(BlockError::ReadOnly);
        }
        {
            let mut data = self.data.lock();
            let range = self.range(lba, buffer.len(), data.len())?;
            data[range].copy_from_slice(buffer);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_write.lock().as_mut() {
            hook();
        }
        Ok(())
    }
}

// ============================================================================
// Scripted USB drive
// ============================================================================

const BULK_IN: u8 = 0x81;
const BULK_OUT: u8 = 0x02;

const CSW_PASSED: u8 = 0;
const CSW_FAILED: u8 = 1;
const CSW_PHASE_ERROR: u8 = 2;

/// Misbehaviour applied to the next command with a given opcode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectedFault {
    /// Run the data phase, then report status 2
    PhaseError,
    /// Answer with the wrong CSW tag
    BadTag,
    /// Stall bulk-IN instead of sending data; the CSW then passes with full residue
    StallDataIn,
    /// Fail the command; REQUEST SENSE reports `key` / `asc`
    FailWithSense { key: u8, asc: u8 },
    /// The CBW transfer times out
    Timeout,
}

type Csw = [u8; CSW_LENGTH];

enum Phase {
    AwaitCbw,
    DataIn {
        data: Vec<u8>,
        sent: usize,
        stall: bool,
        csw: Csw,
    },
    DataOut {
        /// `None` discards the data of a failed command
        lba: Option<u64>,
        data: Vec<u8>,
        expected: usize,
        csw: Csw,
    },
    Status(Csw),
}

/// One side of a Bulk-Only exchange as seen on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireEvent {
    /// CBW accepted with this tag
    Command(u32),
    /// CSW handed back with this tag
    Status(u32),
}

enum Action {
    None,
    In(Vec<u8>),
    Write { lba: u64 },
}

struct DriveState {
    disk: Vec<u8>,
    block_size: u32,
    peripheral_type: u8,
    phase: Phase,
    in_halted: bool,
    /// Sense key and ASC reported by the next REQUEST SENSE
    sense: (u8, u8),
    unit_attention: bool,
    disconnected: bool,
    faults: VecDeque<(u8, InjectedFault)>,
    opcodes: Vec<u8>,
    wire: Vec<WireEvent>,
    control_requests: Vec<(u8, u8, u16, u16)>,
}

fn csw(tag: u32, residue: usize, status: u8) -> Csw {
    let wrapper = CommandStatusWrapper {
        signature: little_endian::U32::new(CSW_SIGNATURE),
        tag: little_endian::U32::new(tag),
        data_residue: little_endian::U32::new(residue as u32),
        status,
    };
    let mut out = [0u8; CSW_LENGTH];
    out.copy_from_slice(wrapper.as_bytes());
    out
}

impl DriveState {
    fn take_fault(&mut self, op: u8) -> Option<InjectedFault> {
        let index = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(index).map(|(_, fault)| fault)
    }

    fn num_blocks(&self) -> u64 {
        (self.disk.len() / self.block_size as usize) as u64
    }

    fn block_range(&self, cb: &[u8; 16]) -> Result<(u64, usize), (u8, u8)> {
        let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]) as u64;
        let blocks = u16::from_be_bytes([cb[7], cb[8]]) as u64;
        if lba + blocks > self.num_blocks() {
            // ILLEGAL REQUEST, LBA out of range
            return Err((0x05, 0x21));
        }
        Ok((lba, (blocks * self.block_size as u64) as usize))
    }

    fn execute(&mut self, cb: &[u8; 16]) -> Result<Action, (u8, u8)> {
        match cb[0] {
            opcode::TEST_UNIT_READY => Ok(Action::None),
            opcode::INQUIRY => {
                let response = InquiryResponse {
                    peripheral: self.peripheral_type,
                    rmb: 0x80,
                    version: 0x04,
                    format: 0x02,
                    additional_length: 31,
                    vendor: *b"CRABMSC ",
                    product: *b"FAKE DRIVE      ",
                    revision: *b"1.00",
                    ..Default::default()
                };
                Ok(Action::In(response.as_bytes().to_vec()))
            }
            opcode::REQUEST_SENSE => {
                let (key, asc) = core::mem::take(&mut self.sense);
                let mut sense = vec![0u8; 18];
                sense[0] = 0x70;
                sense[2] = key;
                sense[7] = 10;
                sense[12] = asc;
                Ok(Action::In(sense))
            }
            opcode::READ_CAPACITY_10 => {
                let response = ReadCapacity10Response {
                    last_lba: big_endian::U32::new((self.num_blocks() - 1) as u32),
                    block_length: big_endian::U32::new(self.block_size),
                };
                Ok(Action::In(response.as_bytes().to_vec()))
            }
            opcode::READ_10 => {
                let (lba, len) = self.block_range(cb)?;
                let start = lba as usize * self.block_size as usize;
                Ok(Action::In(self.disk[start..start + len].to_vec()))
            }
            opcode::WRITE_10 => {
                let (lba, _) = self.block_range(cb)?;
                Ok(Action::Write { lba })
            }
            // ILLEGAL REQUEST, invalid command operation code
            _ => Err((0x05, 0x20)),
        }
    }

    fn accept_cbw(&mut self, bytes: &[u8]) -> Result<usize, UsbError> {
        let cbw = CommandBlockWrapper::read_from_bytes(bytes).map_err(|_| UsbError::Stall)?;
        if cbw.signature.get() != CBW_SIGNATURE {
            return Err(UsbError::Stall);
        }
        let tag = cbw.tag.get();
        let length = cbw.data_transfer_length.get() as usize;
        let data_in = cbw.flags & 0x80 != 0;
        let op = cbw.cb[0];

        let fault = self.take_fault(op);
        if fault == Some(InjectedFault::Timeout) {
            return Err(UsbError::Timeout);
        }
        self.opcodes.push(op);
        self.wire.push(WireEvent::Command(tag));

        let outcome = if self.unit_attention
            && op != opcode::INQUIRY
            && op != opcode::REQUEST_SENSE
        {
            self.unit_attention = false;
            // UNIT ATTENTION, not ready to ready change
            Err((0x06, 0x28))
        } else if let Some(InjectedFault::FailWithSense { key, asc }) = fault {
            Err((key, asc))
        } else {
            self.execute(&cbw.cb)
        };

        let status = if fault == Some(InjectedFault::PhaseError) {
            CSW_PHASE_ERROR
        } else {
            CSW_PASSED
        };
        let reply_tag = if fault == Some(InjectedFault::BadTag) {
            tag.wrapping_add(1)
        } else {
            tag
        };

        self.phase = match outcome {
            Ok(Action::In(mut data)) if length > 0 => {
                data.resize(length, 0);
                if fault == Some(InjectedFault::StallDataIn) {
                    Phase::DataIn {
                        data,
                        sent: 0,
                        stall: true,
                        csw: csw(reply_tag, length, status),
                    }
                } else {
                    Phase::DataIn {
                        data,
                        sent: 0,
                        stall: false,
                        csw: csw(reply_tag, 0, status),
                    }
                }
            }
            Ok(Action::Write { lba }) if length > 0 => Phase::DataOut {
                lba: Some(lba),
                data: Vec::with_capacity(length),
                expected: length,
                csw: csw(reply_tag, 0, status),
            },
            Ok(_) => Phase::Status(csw(reply_tag, 0, status)),
            Err(sense) => {
                self.sense = sense;
                let failed = csw(reply_tag, length, CSW_FAILED);
                if length == 0 {
                    Phase::Status(failed)
                } else if data_in {
                    Phase::DataIn {
                        data: Vec::new(),
                        sent: 0,
                        stall: true,
                        csw: failed,
                    }
                } else {
                    Phase::DataOut {
                        lba: None,
                        data: Vec::with_capacity(length),
                        expected: length,
                        csw: failed,
                    }
                }
            }
        };
        Ok(bytes.len())
    }
}

/// In-memory drive speaking Bulk-Only with the SCSI transparent command set
///
/// Clones share the same drive, so a test can keep one handle for
/// scripting and inspection while the transport owns another.
#[derive(Clone)]
pub struct FakeUsbDrive {
    state: Arc<Mutex<DriveState>>,
}

impl FakeUsbDrive {
    pub fn new(num_blocks: u64, block_size: u32) -> Self {
        Self::with_image(vec![0u8; (num_blocks * block_size as u64) as usize], block_size)
    }

    pub fn with_image(image: Vec<u8>, block_size: u32) -> Self {
        assert_eq!(image.len() % block_size as usize, 0);
        Self {
            state: Arc::new(Mutex::new(DriveState {
                disk: image,
                block_size,
                peripheral_type: 0x00,
                phase: Phase::AwaitCbw,
                in_halted: false,
                sense: (0, 0),
                unit_attention: false,
                disconnected: false,
                faults: VecDeque::new(),
                opcodes: Vec::new(),
                wire: Vec::new(),
                control_requests: Vec::new(),
            })),
        }
    }

    /// Apply `fault` to the next command with `op`
    pub fn inject(&self, op: u8, fault: InjectedFault) {
        self.state.lock().faults.push_back((op, fault));
    }

    /// Opcodes of every CBW the drive accepted
    pub fn opcodes(&self) -> Vec<u8> {
        self.state.lock().opcodes.clone()
    }

    /// CBWs and CSWs in the order they crossed the bus
    pub fn wire_log(&self) -> Vec<WireEvent> {
        self.state.lock().wire.clone()
    }

    /// `(bmRequestType, bRequest, wValue, wIndex)` of every control transfer
    pub fn control_requests(&self) -> Vec<(u8, u8, u16, u16)> {
        self.state.lock().control_requests.clone()
    }

    pub fn clear_logs(&self) {
        let mut state = self.state.lock();
        state.opcodes.clear();
        state.wire.clear();
        state.control_requests.clear();
    }

    pub fn set_peripheral_type(&self, peripheral_type: u8) {
        self.state.lock().peripheral_type = peripheral_type;
    }

    /// Fail the next command other than INQUIRY / REQUEST SENSE with UNIT ATTENTION
    pub fn raise_unit_attention(&self) {
        self.state.lock().unit_attention = true;
    }

    /// Every transfer fails with `Disconnected` from now on
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

impl UsbCommunication for FakeUsbDrive {
    fn bulk_out_transfer(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        match core::mem::replace(&mut state.phase, Phase::AwaitCbw) {
            Phase::AwaitCbw => state.accept_cbw(data),
            Phase::DataOut {
                lba,
                data: mut received,
                expected,
                csw,
            } => {
                let n = data.len().min(expected - received.len());
                received.extend_from_slice(&data[..n]);
                if received.len() < expected {
                    state.phase = Phase::DataOut {
                        lba,
                        data: received,
                        expected,
                        csw,
                    };
                    return Ok(n);
                }
                if let Some(lba) = lba {
                    let start = lba as usize * state.block_size as usize;
                    state.disk[start..start + expected].copy_from_slice(&received);
                }
                state.phase = Phase::Status(csw);
                Ok(n)
            }
            other => {
                state.phase = other;
                Err(UsbError::Stall)
            }
        }
    }

    fn bulk_in_transfer(&mut self, data: &mut [u8]) -> Result<usize, UsbError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        if state.in_halted {
            return Err(UsbError::Stall);
        }
        match core::mem::replace(&mut state.phase, Phase::AwaitCbw) {
            Phase::DataIn {
                stall: true, csw, ..
            } => {
                state.in_halted = true;
                state.phase = Phase::Status(csw);
                Err(UsbError::Stall)
            }
            Phase::DataIn {
                data: payload,
                sent,
                stall: false,
                csw,
            } => {
                let n = (payload.len() - sent).min(data.len());
                data[..n].copy_from_slice(&payload[sent..sent + n]);
                let sent = sent + n;
                state.phase = if sent == payload.len() {
                    Phase::Status(csw)
                } else {
                    Phase::DataIn {
                        data: payload,
                        sent,
                        stall: false,
                        csw,
                    }
                };
                Ok(n)
            }
            Phase::Status(csw) if data.len() >= CSW_LENGTH => {
                data[..CSW_LENGTH].copy_from_slice(&csw);
                let tag = u32::from_le_bytes([csw[4], csw[5], csw[6], csw[7]]);
                state.wire.push(WireEvent::Status(tag));
                Ok(CSW_LENGTH)
            }
            other => {
                state.phase = other;
                Err(UsbError::Stall)
            }
        }
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request_code: u8,
        value: u16,
        index: u16,
        _data: Option<&mut [u8]>,
    ) -> Result<usize, UsbError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(UsbError::Disconnected);
        }
        state
            .control_requests
            .push((request_type, request_code, value, index));

        let class_reset = req_type::DIR_OUT | req_type::TYPE_CLASS | req_type::RCPT_INTERFACE;
        let clear_halt = req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_ENDPOINT;
        if request_type == class_reset && request_code == msc_request::BULK_ONLY_RESET {
            state.phase = Phase::AwaitCbw;
        } else if request_type == clear_halt
            && request_code == request::CLEAR_FEATURE
            && index == BULK_IN as u16
        {
            state.in_halted = false;
        }
        Ok(0)
    }

    fn interface_number(&self) -> u8 {
        0
    }

    fn bulk_in_address(&self) -> u8 {
        BULK_IN
    }

    fn bulk_out_address(&self) -> u8 {
        BULK_OUT
    }
}

// ============================================================================
// Volume images
// ============================================================================

const SECTOR: usize = 512;
const RESERVED_SECTORS: u32 = 32;
const NUM_FATS: u32 = 2;
const FS_INFO_SECTOR: usize = 1;
const BACKUP_BOOT_SECTOR: usize = 6;

/// A freshly formatted FAT32 volume: 512-byte sectors, one sector per
/// cluster, root directory in cluster 2 holding only the volume label
pub fn format_fat32(total_sectors: u32, label: &str) -> Vec<u8> {
    // FAT size and cluster count depend on each other; iterate to a fixed point
    let mut sectors_per_fat = 1u32;
    let clusters = loop {
        let clusters = total_sectors - RESERVED_SECTORS - NUM_FATS * sectors_per_fat;
        let needed = ((clusters + 2) * 4).div_ceil(SECTOR as u32);
        if needed <= sectors_per_fat {
            break clusters;
        }
        sectors_per_fat = needed;
    };

    let mut label_field = [b' '; 11];
    for (dst, src) in label_field.iter_mut().zip(label.bytes()) {
        *dst = src;
    }

    let mut image = vec![0u8; total_sectors as usize * SECTOR];

    let mut boot = RawBootSector::new_zeroed();
    boot.jmp = [0xEB, 0x58, 0x90];
    boot.oem_name = *b"CRABMSC ";
    boot.bytes_per_sector = little_endian::U16::new(SECTOR as u16);
    boot.sectors_per_cluster = 1;
    boot.reserved_sectors = little_endian::U16::new(RESERVED_SECTORS as u16);
    boot.num_fats = NUM_FATS as u8;
    boot.media_type = 0xF8;
    boot.sectors_per_track = little_endian::U16::new(32);
    boot.num_heads = little_endian::U16::new(64);
    boot.total_sectors_32 = little_endian::U32::new(total_sectors);
    boot.sectors_per_fat_32 = little_endian::U32::new(sectors_per_fat);
    boot.root_cluster = little_endian::U32::new(2);
    boot.fs_info = little_endian::U16::new(FS_INFO_SECTOR as u16);
    boot.backup_boot_sector = little_endian::U16::new(BACKUP_BOOT_SECTOR as u16);
    boot.drive_number = 0x80;
    boot.boot_sig = 0x29;
    boot.volume_serial = little_endian::U32::new(0x1234_5678);
    boot.volume_label = label_field;
    boot.fs_type = *FAT32_SIGNATURE;

    for sector in [0, BACKUP_BOOT_SECTOR] {
        let at = sector * SECTOR;
        image[at..at + boot.as_bytes().len()].copy_from_slice(boot.as_bytes());
        image[at + 510] = 0x55;
        image[at + 511] = 0xAA;
    }

    let mut fs_info = RawFsInfo::new_zeroed();
    fs_info.lead_signature = little_endian::U32::new(0x4161_5252);
    fs_info.struct_signature = little_endian::U32::new(0x6141_7272);
    fs_info.free_count = little_endian::U32::new(clusters - 1);
    fs_info.next_free = little_endian::U32::new(3);
    fs_info.trail_signature = little_endian::U32::new(0xAA55_0000);
    let at = FS_INFO_SECTOR * SECTOR;
    image[at..at + SECTOR].copy_from_slice(fs_info.as_bytes());

    for n in 0..NUM_FATS {
        let at = (RESERVED_SECTORS + n * sectors_per_fat) as usize * SECTOR;
        for (i, value) in [0x0FFF_FFF8u32, 0x0FFF_FFFF, 0x0FFF_FFFF].iter().enumerate() {
            image[at + i * 4..at + i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    if !label.is_empty() {
        let root = (RESERVED_SECTORS + NUM_FATS * sectors_per_fat) as usize * SECTOR;
        let entry = &mut image[root..root + DIR_ENTRY_SIZE];
        entry[..11].copy_from_slice(&label_field);
        entry[11] = ATTR_VOLUME_ID;
    }

    image
}

/// Put `volume` behind an MBR with a single primary partition at `start_lba`
pub fn mbr_wrap(volume: &[u8], start_lba: u32, type_code: u8) -> Vec<u8> {
    let mut image = vec![0u8; start_lba as usize * SECTOR];
    image.extend_from_slice(volume);

    let slot = MbrPartitionEntry {
        partition_type: type_code,
        first_lba: little_endian::U32::new(start_lba),
        num_sectors: little_endian::U32::new((volume.len() / SECTOR) as u32),
        ..Default::default()
    };
    image[446..462].copy_from_slice(slot.as_bytes());
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}
