//! FAT32 directory entries: 8.3 names, long-name reassembly, timestamps.

use std::fmt;

pub(crate) const DIR_ENTRY_LEN: usize = 32;

/* attribute bits at offset 11 */
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_LONG_NAME: u8 = 0x0F;

/* first-byte markers */
const ENTRY_END: u8 = 0x00;
const ENTRY_FREE: u8 = 0xE5;
/// A real leading 0xE5 is stored as 0x05 (KANJI escape).
const ENTRY_KANJI: u8 = 0x05;

const LFN_ORDER_MASK: u8 = 0x1F;
/// Byte offsets of the 13 UTF-16LE characters inside a long-name entry.
const LFN_CHAR_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Wall-clock timestamp decoded from FAT date/time words.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// Stand-in for the zero date some writers leave behind.
    pub const EPOCH: Timestamp = Timestamp {
        year: 1970,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
    };

    /// Decodes the on-disk date/time words. A zero month or day yields
    /// [`Timestamp::EPOCH`].
    pub fn from_fat(date: u16, time: u16) -> Timestamp {
        let month = ((date >> 5) & 0xF) as u8;
        let day = (date & 0x1F) as u8;
        if month == 0 || day == 0 {
            return Timestamp::EPOCH;
        }
        Timestamp {
            year: 1980 + (date >> 9),
            month,
            day,
            hour: (time >> 11) as u8,
            minute: ((time >> 5) & 0x3F) as u8,
            second: ((time & 0x1F) * 2) as u8,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A parsed short entry, long name already attached when one preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// File size in bytes; 0 for directories.
    pub size: u32,
    pub is_directory: bool,
    pub first_cluster: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
}

/// What one raw 32-byte slot turned out to be.
pub(crate) enum ParsedSlot {
    /// First byte 0x00: no entries past this point in the whole directory.
    End,
    /// Free slot or a long-name fragment; nothing to emit yet.
    Incomplete,
    Entry(DirEntry),
}

/// Streaming parser over consecutive directory slots.
///
/// Long-name fragments accumulate across [`feed`] calls until the short entry
/// they belong to arrives, so a chain of slots may span cluster boundaries.
///
/// [`feed`]: DirEntryParser::feed
#[derive(Default)]
pub(crate) struct DirEntryParser {
    long_name: Vec<u16>,
}

impl DirEntryParser {
    pub fn new() -> DirEntryParser {
        DirEntryParser::default()
    }

    pub fn feed(&mut self, raw: &[u8]) -> ParsedSlot {
        debug_assert!(raw.len() >= DIR_ENTRY_LEN);

        match raw[0] {
            ENTRY_END => return ParsedSlot::End,
            ENTRY_FREE => return ParsedSlot::Incomplete,
            _ => {}
        }

        if raw[11] == ATTR_LONG_NAME {
            log::trace!("fat32: long-name fragment {}", raw[0] & LFN_ORDER_MASK);
            // fragments arrive highest-order first; prepending restores name order
            let mut fragment = lfn_fragment(raw);
            fragment.extend_from_slice(&self.long_name);
            self.long_name = fragment;
            return ParsedSlot::Incomplete;
        }

        let name = if self.long_name.is_empty() {
            short_name(raw)
        } else {
            String::from_utf16_lossy(&std::mem::take(&mut self.long_name))
        };

        let first_cluster_high = u16::from_le_bytes(raw[20..22].try_into().unwrap());
        let first_cluster_low = u16::from_le_bytes(raw[26..28].try_into().unwrap());

        ParsedSlot::Entry(DirEntry {
            name,
            size: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
            is_directory: raw[11] & ATTR_DIRECTORY != 0,
            first_cluster: u32::from(first_cluster_high) << 16 | u32::from(first_cluster_low),
            created: Timestamp::from_fat(
                u16::from_le_bytes(raw[16..18].try_into().unwrap()),
                u16::from_le_bytes(raw[14..16].try_into().unwrap()),
            ),
            modified: Timestamp::from_fat(
                u16::from_le_bytes(raw[24..26].try_into().unwrap()),
                u16::from_le_bytes(raw[22..24].try_into().unwrap()),
            ),
        })
    }
}

/// The 13 characters of a long-name slot, truncated at the first NUL.
fn lfn_fragment(raw: &[u8]) -> Vec<u16> {
    LFN_CHAR_OFFSETS
        .iter()
        .map(|&offset| u16::from_le_bytes([raw[offset], raw[offset + 1]]))
        .take_while(|&c| c != 0)
        .collect()
}

/// Builds `BASE.EXT` out of the padded 8.3 field.
fn short_name(raw: &[u8]) -> String {
    let mut base: Vec<u8> = raw[..8].to_vec();
    if base[0] == ENTRY_KANJI {
        base[0] = ENTRY_FREE;
    }
    let base = trim_padding(&base);
    let ext = trim_padding(&raw[8..11]);

    let mut name: String = base.iter().map(|&b| b as char).collect();
    if !ext.is_empty() {
        name.push('.');
        name.extend(ext.iter().map(|&b| b as char));
    }
    name
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |pos| pos + 1);
    &field[..end]
}
