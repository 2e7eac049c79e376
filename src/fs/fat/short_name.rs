//! 8.3 short names and their generation from long names

use super::FatError;
use std::collections::HashSet;

/// Characters allowed in a short name besides A-Z and 0-9
const SPECIAL: &[u8] = b"$%'-_@~`!(){}^#&";

/// Highest numeric tail tried before giving up
const MAX_TAIL: u32 = 999_999;

/// A space-padded 8.3 name as stored in a directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShortName([u8; 11]);

impl ShortName {
    pub const DOT: ShortName = ShortName(*b".          ");
    pub const DOT_DOT: ShortName = ShortName(*b"..         ");

    pub fn from_raw(raw: [u8; 11]) -> Self {
        Self(raw)
    }

    /// Bytes for the directory entry (0xE5 lead byte escaped as 0x05)
    pub fn to_raw(self) -> [u8; 11] {
        let mut raw = self.0;
        if raw[0] == 0xE5 {
            raw[0] = 0x05;
        }
        raw
    }

    /// Decode the on-disk form (0x05 lead byte means 0xE5)
    pub fn from_disk(raw: [u8; 11]) -> Self {
        let mut name = raw;
        if name[0] == 0x05 {
            name[0] = 0xE5;
        }
        Self(name)
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }

    pub fn is_dot_entry(&self) -> bool {
        *self == Self::DOT || *self == Self::DOT_DOT
    }

    /// `NAME.EXT` form, optionally lower-casing either part
    pub fn display(&self, lower_base: bool, lower_ext: bool) -> heapless::String<12> {
        let mut s = heapless::String::new();
        let convert = |c: u8, lower: bool| {
            let c = c as char;
            if lower {
                c.to_ascii_lowercase()
            } else {
                c
            }
        };

        self.0[..8]
            .iter()
            .take_while(|&&c| c != b' ')
            .for_each(|&c| {
                let _ = s.push(convert(c, lower_base));
            });

        if self.0[8] != b' ' {
            let _ = s.push('.');
            self.0[8..]
                .iter()
                .take_while(|&&c| c != b' ')
                .for_each(|&c| {
                    let _ = s.push(convert(c, lower_ext));
                });
        }

        s
    }

    /// LFN checksum over the 11 name bytes
    pub fn checksum(&self) -> u8 {
        self.to_raw()
            .iter()
            .fold(0u8, |sum, &c| (sum >> 1).wrapping_add((sum & 1) << 7).wrapping_add(c))
    }
}

fn map_char(c: char, lossy: &mut bool) -> u8 {
    let upper = c.to_ascii_uppercase();
    if upper.is_ascii_uppercase() || upper.is_ascii_digit() || SPECIAL.contains(&(upper as u8)) {
        if !upper.is_ascii() {
            *lossy = true;
            return b'_';
        }
        upper as u8
    } else {
        *lossy = true;
        b'_'
    }
}

/// Generate a short name for `long_name` that is not in `existing`
///
/// Spaces and leading dots are dropped, invalid characters become `_`,
/// and the base and extension are cut to 8 and 3 characters. A lossy or
/// colliding result gets a `~N` tail.
pub fn generate(long_name: &str, existing: &HashSet<ShortName>) -> Result<ShortName, FatError> {
    let trimmed = long_name.trim_start_matches('.');
    let mut lossy = trimmed.len() != long_name.len() || long_name.contains(' ');

    let (base_part, ext_part) = match trimmed.rfind('.') {
        Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
        None => (trimmed, ""),
    };

    let mut base: Vec<u8> = base_part
        .chars()
        .filter(|&c| c != ' ')
        .map(|c| if c == '.' { '_' } else { c })
        .map(|c| map_char(c, &mut lossy))
        .collect();
    if base_part.contains('.') {
        lossy = true;
    }
    let mut ext: Vec<u8> = ext_part
        .chars()
        .filter(|&c| c != ' ')
        .map(|c| map_char(c, &mut lossy))
        .collect();

    if base.len() > 8 {
        base.truncate(8);
        lossy = true;
    }
    if ext.len() > 3 {
        ext.truncate(3);
        lossy = true;
    }
    if base.is_empty() {
        base.push(b'_');
        lossy = true;
    }

    let build = |base: &[u8]| {
        let mut raw = [b' '; 11];
        raw[..base.len()].copy_from_slice(base);
        raw[8..8 + ext.len()].copy_from_slice(&ext);
        ShortName(raw)
    };

    let plain = build(&base);
    if !lossy && !existing.contains(&plain) {
        return Ok(plain);
    }

    for n in 1..=MAX_TAIL {
        let tail = format!("~{}", n);
        let keep = base.len().min(8 - tail.len());
        let mut candidate = base[..keep].to_vec();
        candidate.extend_from_slice(tail.as_bytes());
        let name = build(&candidate);
        if !existing.contains(&name) {
            return Ok(name);
        }
    }

    Err(FatError::NoUniqueShortName)
}
