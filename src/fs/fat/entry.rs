//! FAT directory entries
//!
//! A directory is a flat array of 32-byte records. A file or subdirectory is
//! one short (8.3) entry, optionally preceded by long file name fragments
//! that hold the full name as UTF-16, 13 units per fragment, last fragment
//! first. `DirEntryGroup` keeps the fragments and the short entry together
//! so they are always read, rewritten and removed as one unit.

use super::short_name::ShortName;
use crate::time::FatTimestamp;
use spin::Mutex;
use std::sync::Arc;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of one directory record
pub const DIR_ENTRY_SIZE: usize = 32;

/// Directory entry attributes
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LFN: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First name byte of a deleted entry
pub const DELETED_MARKER: u8 = 0xE5;
/// First name byte of the end-of-directory marker
pub const END_MARKER: u8 = 0x00;

/// Set on the ordinal of the last (first stored) LFN fragment
const LFN_LAST_FRAGMENT: u8 = 0x40;
const LFN_ORDINAL_MASK: u8 = 0x1F;
/// UTF-16 units per LFN fragment
const LFN_CHARS: usize = 13;
/// Longest name VFAT can store
pub const MAX_LONG_NAME: usize = 255;

/// NT reserved byte: base name is stored lower case
const NT_LOWER_BASE: u8 = 0x08;
/// NT reserved byte: extension is stored lower case
const NT_LOWER_EXT: u8 = 0x10;

/// Standard 8.3 directory entry
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
pub struct RawDirEntry {
    /// Base name and extension, space padded
    pub name: [u8; 11],
    pub attr: u8,
    /// Case flags (Windows NT)
    pub nt_reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: U16,
    pub creation_date: U16,
    pub last_access_date: U16,
    /// First cluster high (FAT32)
    pub first_cluster_hi: U16,
    pub modification_time: U16,
    pub modification_date: U16,
    pub first_cluster_lo: U16,
    pub file_size: U32,
}

/// Long file name fragment
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
pub struct LfnEntry {
    /// Sequence number (1-based) plus the last-fragment flag
    pub ordinal: u8,
    pub name1: [U16; 5],
    /// Always `ATTR_LFN`
    pub attr: u8,
    pub entry_type: u8,
    /// Checksum of the short name this fragment belongs to
    pub checksum: u8,
    pub name2: [U16; 6],
    /// Always zero
    pub first_cluster_lo: U16,
    pub name3: [U16; 2],
}

impl LfnEntry {
    fn units(&self) -> [u16; LFN_CHARS] {
        let mut out = [0u16; LFN_CHARS];
        let all = self.name1.iter().chain(&self.name2).chain(&self.name3);
        for (dst, src) in out.iter_mut().zip(all) {
            *dst = src.get();
        }
        out
    }

    fn new(ordinal: u8, checksum: u8, units: &[u16; LFN_CHARS]) -> Self {
        let unit = |i: usize| U16::new(units[i]);
        Self {
            ordinal,
            name1: [unit(0), unit(1), unit(2), unit(3), unit(4)],
            attr: ATTR_LFN,
            entry_type: 0,
            checksum,
            name2: [unit(5), unit(6), unit(7), unit(8), unit(9), unit(10)],
            first_cluster_lo: U16::new(0),
            name3: [unit(11), unit(12)],
        }
    }
}

impl RawDirEntry {
    /// A fresh entry stamped with `now_ms` for creation, access and modification
    pub fn new(short: ShortName, attr: u8, cluster: u32, now_ms: u64) -> Self {
        let stamp = FatTimestamp::from_unix_ms(now_ms);
        let mut entry = Self::new_zeroed();
        entry.name = short.to_raw();
        entry.attr = attr;
        entry.creation_time_tenths = stamp.tenths;
        entry.creation_time = U16::new(stamp.time);
        entry.creation_date = U16::new(stamp.date);
        entry.last_access_date = U16::new(stamp.date);
        entry.modification_time = U16::new(stamp.time);
        entry.modification_date = U16::new(stamp.date);
        entry.set_first_cluster(cluster);
        entry
    }

    /// Get the first cluster number
    pub fn first_cluster(&self) -> u32 {
        ((self.first_cluster_hi.get() as u32) << 16) | (self.first_cluster_lo.get() as u32)
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_hi = U16::new((cluster >> 16) as u16);
        self.first_cluster_lo = U16::new(cluster as u16);
    }

    pub fn short_name(&self) -> ShortName {
        ShortName::from_disk(self.name)
    }

    /// Check if this is a directory
    pub fn is_directory(&self) -> bool {
        (self.attr & ATTR_DIRECTORY) != 0
    }

    /// Check if this is a volume ID
    pub fn is_volume_id(&self) -> bool {
        !self.is_lfn() && (self.attr & ATTR_VOLUME_ID) != 0
    }

    /// Check if this is a long filename entry
    pub fn is_lfn(&self) -> bool {
        (self.attr & ATTR_LFN) == ATTR_LFN
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_MARKER
    }

    /// Check if this is the end of directory marker
    pub fn is_end(&self) -> bool {
        self.name[0] == END_MARKER
    }

    /// The 8.3 name as shown, honouring the NT lower-case flags
    pub fn display_name(&self) -> String {
        self.short_name()
            .display(
                self.nt_reserved & NT_LOWER_BASE != 0,
                self.nt_reserved & NT_LOWER_EXT != 0,
            )
            .to_string()
    }

    /// Volume label text, trailing spaces removed
    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.name).trim_end().to_string()
    }
}

/// One file or directory: its LFN fragments (as a decoded name) and short entry
#[derive(Clone, Debug)]
pub struct DirEntryGroup {
    pub long_name: Option<String>,
    pub actual: RawDirEntry,
}

/// Directory entry shared between a directory's entry list and the node
/// bound to it, so size and cluster updates are seen by the next persist
pub type SharedEntry = Arc<Mutex<DirEntryGroup>>;

impl DirEntryGroup {
    /// Entry for `name`, storing LFN fragments only when the 8.3 form differs
    pub fn new(name: &str, short: ShortName, attr: u8, cluster: u32, now_ms: u64) -> Self {
        let actual = RawDirEntry::new(short, attr, cluster, now_ms);
        let long_name = if short.display(false, false).as_str() == name {
            None
        } else {
            Some(name.to_string())
        };
        Self { long_name, actual }
    }

    pub fn name(&self) -> String {
        match &self.long_name {
            Some(name) => name.clone(),
            None => self.actual.display_name(),
        }
    }

    pub fn short_name(&self) -> ShortName {
        self.actual.short_name()
    }

    /// Change the name; LFN fragments and case flags follow the new name
    pub fn rename(&mut self, name: &str, short: ShortName) {
        self.actual.name = short.to_raw();
        self.actual.nt_reserved &= !(NT_LOWER_BASE | NT_LOWER_EXT);
        self.long_name = if short.display(false, false).as_str() == name {
            None
        } else {
            Some(name.to_string())
        };
    }

    pub fn is_directory(&self) -> bool {
        self.actual.is_directory()
    }

    pub fn is_dot_entry(&self) -> bool {
        self.short_name().is_dot_entry()
    }

    pub fn start_cluster(&self) -> u32 {
        self.actual.first_cluster()
    }

    pub fn set_start_cluster(&mut self, cluster: u32) {
        self.actual.set_first_cluster(cluster);
    }

    pub fn file_size(&self) -> u32 {
        self.actual.file_size.get()
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.actual.file_size = U32::new(size);
    }

    pub fn created_ms(&self) -> u64 {
        FatTimestamp {
            date: self.actual.creation_date.get(),
            time: self.actual.creation_time.get(),
            tenths: self.actual.creation_time_tenths,
        }
        .to_unix_ms()
    }

    pub fn modified_ms(&self) -> u64 {
        FatTimestamp {
            date: self.actual.modification_date.get(),
            time: self.actual.modification_time.get(),
            tenths: 0,
        }
        .to_unix_ms()
    }

    pub fn accessed_ms(&self) -> u64 {
        FatTimestamp {
            date: self.actual.last_access_date.get(),
            time: 0,
            tenths: 0,
        }
        .to_unix_ms()
    }

    /// Stamp a content change
    pub fn touch_modified(&mut self, now_ms: u64) {
        let stamp = FatTimestamp::from_unix_ms(now_ms);
        self.actual.modification_time = U16::new(stamp.time);
        self.actual.modification_date = U16::new(stamp.date);
        self.actual.last_access_date = U16::new(stamp.date);
    }

    /// Append the LFN fragments (last first) and the short entry to `out`
    pub fn serialize(&self, out: &mut Vec<u8>) {
        if let Some(name) = &self.long_name {
            let units: Vec<u16> = name.encode_utf16().collect();
            let fragments = units.len().div_ceil(LFN_CHARS);
            let checksum = self.short_name().checksum();

            for index in (0..fragments).rev() {
                let mut chunk = [0xFFFFu16; LFN_CHARS];
                let start = index * LFN_CHARS;
                let part = &units[start..units.len().min(start + LFN_CHARS)];
                chunk[..part.len()].copy_from_slice(part);
                if part.len() < LFN_CHARS {
                    chunk[part.len()] = 0x0000;
                }

                let mut ordinal = (index + 1) as u8;
                if index + 1 == fragments {
                    ordinal |= LFN_LAST_FRAGMENT;
                }
                out.extend_from_slice(LfnEntry::new(ordinal, checksum, &chunk).as_bytes());
            }
        }
        out.extend_from_slice(self.actual.as_bytes());
    }
}

/// Decoded contents of a directory's cluster chain
#[derive(Default)]
pub struct ParsedDirectory {
    /// Volume label entry (root directory only)
    pub volume_label: Option<RawDirEntry>,
    /// Every live entry, dot entries included, in on-disk order
    pub groups: Vec<DirEntryGroup>,
}

/// LFN fragments collected ahead of their short entry
#[derive(Default)]
struct PendingLongName {
    checksum: u8,
    count: u8,
    fragments: Vec<(u8, [u16; LFN_CHARS])>,
}

impl PendingLongName {
    fn push(&mut self, lfn: &LfnEntry) {
        if lfn.ordinal & LFN_LAST_FRAGMENT != 0 {
            self.fragments.clear();
            self.count = lfn.ordinal & LFN_ORDINAL_MASK;
            self.checksum = lfn.checksum;
        } else if self.fragments.is_empty() {
            log::debug!("FAT32: orphan LFN fragment {:#04x}", lfn.ordinal);
            return;
        } else if lfn.checksum != self.checksum {
            log::debug!("FAT32: LFN fragment checksum changed mid-name");
            self.fragments.clear();
            return;
        }
        self.fragments.push((lfn.ordinal & LFN_ORDINAL_MASK, lfn.units()));
    }

    /// Assemble the name if the fragments are complete and match `short`
    fn take(&mut self, short: &ShortName) -> Option<String> {
        if self.fragments.is_empty() {
            return None;
        }
        let mut fragments = core::mem::take(&mut self.fragments);
        if self.checksum != short.checksum() || fragments.len() != self.count as usize {
            log::debug!(
                "FAT32: discarding long name for {:?} (checksum or fragment count mismatch)",
                short.display(false, false)
            );
            return None;
        }

        fragments.sort_by_key(|(ordinal, _)| *ordinal);
        let mut units = Vec::with_capacity(fragments.len() * LFN_CHARS);
        for (expected, (ordinal, chunk)) in fragments.iter().enumerate() {
            if *ordinal as usize != expected + 1 {
                return None;
            }
            units.extend_from_slice(chunk);
        }
        if let Some(end) = units.iter().position(|&u| u == 0) {
            units.truncate(end);
        }
        Some(String::from_utf16_lossy(&units))
    }

    fn clear(&mut self) {
        self.fragments.clear();
    }
}

/// Decode a directory's raw bytes into entry groups
pub fn parse_entries(bytes: &[u8]) -> ParsedDirectory {
    let mut parsed = ParsedDirectory::default();
    let mut pending = PendingLongName::default();

    for record in bytes.chunks_exact(DIR_ENTRY_SIZE) {
        let Ok(entry) = RawDirEntry::read_from_bytes(record) else {
            continue;
        };

        if entry.is_end() {
            break;
        }
        if entry.is_deleted() {
            pending.clear();
            continue;
        }
        if entry.is_lfn() {
            if let Ok(lfn) = LfnEntry::read_from_bytes(record) {
                pending.push(&lfn);
            }
            continue;
        }
        if entry.is_volume_id() {
            pending.clear();
            parsed.volume_label = Some(entry);
            continue;
        }

        let long_name = pending.take(&entry.short_name());
        parsed.groups.push(DirEntryGroup {
            long_name,
            actual: entry,
        });
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, short: &[u8; 11]) -> DirEntryGroup {
        DirEntryGroup::new(name, ShortName::from_raw(*short), ATTR_ARCHIVE, 5, 0)
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(core::mem::size_of::<RawDirEntry>(), DIR_ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<LfnEntry>(), DIR_ENTRY_SIZE);
    }

    #[test]
    fn test_long_name_group_lists_as_one_entry() {
        let g = group("A rather long song title.flac", b"ARATHE~1FLA");
        let mut bytes = Vec::new();
        g.serialize(&mut bytes);
        assert_eq!(bytes.len(), 4 * DIR_ENTRY_SIZE);
        // Last fragment is stored first
        assert_eq!(bytes[0], 0x43);
        assert_eq!(bytes[11], ATTR_LFN);

        let parsed = parse_entries(&bytes);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].name(), "A rather long song title.flac");
        assert_eq!(parsed.groups[0].start_cluster(), 5);
    }

    #[test]
    fn test_exact_multiple_of_thirteen_has_no_terminator() {
        let g = group("abcdefghijklm", b"ABCDEF~1   ");
        let mut bytes = Vec::new();
        g.serialize(&mut bytes);
        assert_eq!(bytes.len(), 2 * DIR_ENTRY_SIZE);
        assert_eq!(parse_entries(&bytes).groups[0].name(), "abcdefghijklm");
    }

    #[test]
    fn test_plain_short_name_needs_no_fragments() {
        let g = group("README.TXT", b"README  TXT");
        assert!(g.long_name.is_none());
        let mut bytes = Vec::new();
        g.serialize(&mut bytes);
        assert_eq!(bytes.len(), DIR_ENTRY_SIZE);
    }

    #[test]
    fn test_checksum_mismatch_falls_back_to_short_name() {
        let g = group("Some Long Name.txt", b"SOMELO~1TXT");
        let mut bytes = Vec::new();
        g.serialize(&mut bytes);
        // Corrupt the checksum of the first stored fragment
        bytes[13] ^= 0xFF;

        let parsed = parse_entries(&bytes);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].name(), "SOMELO~1.TXT");
    }

    #[test]
    fn test_deleted_and_label_entries_are_skipped() {
        let mut bytes = Vec::new();
        let label = RawDirEntry::new(ShortName::from_raw(*b"MUSIC      "), ATTR_VOLUME_ID, 0, 0);
        bytes.extend_from_slice(label.as_bytes());

        let mut deleted = Vec::new();
        group("Gone forever.mp3", b"GONEFO~1MP3").serialize(&mut deleted);
        deleted[0] = DELETED_MARKER;
        let last = deleted.len() - DIR_ENTRY_SIZE;
        deleted[last] = DELETED_MARKER;
        bytes.extend_from_slice(&deleted);

        group("KEEP.MP3", b"KEEP    MP3").serialize(&mut bytes);
        bytes.extend_from_slice(&[0u8; DIR_ENTRY_SIZE]);
        // Nothing after the end marker is read
        group("AFTER.MP3", b"AFTER   MP3").serialize(&mut bytes);

        let parsed = parse_entries(&bytes);
        assert_eq!(parsed.volume_label.map(|l| l.label()), Some("MUSIC".to_string()));
        let names: Vec<String> = parsed.groups.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["KEEP.MP3"]);
    }

    #[test]
    fn test_nt_lowercase_flags() {
        let mut entry = RawDirEntry::new(ShortName::from_raw(*b"NOTES   TXT"), ATTR_ARCHIVE, 0, 0);
        entry.nt_reserved = NT_LOWER_BASE | NT_LOWER_EXT;
        assert_eq!(entry.display_name(), "notes.txt");
    }

    #[test]
    fn test_cluster_split_across_halves() {
        let mut g = group("X.BIN", b"X       BIN");
        g.set_start_cluster(0x0012_3456);
        assert_eq!(g.actual.first_cluster_hi.get(), 0x0012);
        assert_eq!(g.actual.first_cluster_lo.get(), 0x3456);
        assert_eq!(g.start_cluster(), 0x0012_3456);
    }
}
