//! In-place decoding of 1 KB MFT records lifted out of cache blocks.
//!
//! The resident copy of `$MFT` never went through the on-disk fix-up path,
//! so records are decoded exactly as found, no update-sequence patching.
//! Only the two attributes the tree needs are pulled out:
//! `$STANDARD_INFORMATION` for the timestamps and `$FILE_NAME` for the name
//! and the parent reference.
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};

/// Size of one MFT record.
pub const RECORD_SIZE: usize = 0x400;

/// Magic marking a live record.
const RECORD_MAGIC: &[u8; 4] = b"FILE";

/// Offset of the attribute run, record number and so on in the record
/// header.
const FIRST_ATTRIBUTE_OFFSET: usize = 0x14;
const RECORD_NUMBER_OFFSET: usize = 0x2c;

/// Attribute type codes.
const STANDARD_INFORMATION: u32 = 0x10;
const FILE_NAME: u32 = 0x30;
const END_MARKER: u32 = 0xffff_ffff;

/// The 8.3 fallback namespace of a `$FILE_NAME`.
const DOS_NAMESPACE: u8 = 2;

/// The low 48 bits of an MFT reference are the record number; the rest is a
/// sequence count.
const MFT_REFERENCE_MASK: u64 = 0xffff_ffff_ffff;

/// Convert a Windows FILETIME (100ns ticks since 1601-01-01) to a UTC
/// timestamp. Out-of-range values collapse to the epoch.
fn filetime(ticks: u64) -> DateTime<Utc> {
    const TICKS_TO_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

    let unix_ticks = ticks.saturating_sub(TICKS_TO_UNIX_EPOCH);
    let seconds = (unix_ticks / 10_000_000) as i64;
    let nanoseconds = ((unix_ticks % 10_000_000) * 100) as u32;

    Utc.timestamp_opt(seconds, nanoseconds)
        .single()
        .unwrap_or_default()
}

/// The four timestamps of a `$STANDARD_INFORMATION` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardInformation {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub mft_modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
}

impl StandardInformation {
    fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 0x20 {
            return None;
        }

        Some(Self {
            created: filetime(LittleEndian::read_u64(&value[0x0..])),
            modified: filetime(LittleEndian::read_u64(&value[0x8..])),
            mft_modified: filetime(LittleEndian::read_u64(&value[0x10..])),
            accessed: filetime(LittleEndian::read_u64(&value[0x18..])),
        })
    }
}

/// The parts of a `$FILE_NAME` attribute the tree cares about.
struct FileName {
    parent: u64,
    namespace: u8,
    name: String,
}

impl FileName {
    fn parse(value: &[u8]) -> Option<Self> {
        if value.len() < 0x42 {
            return None;
        }

        let name_len = usize::from(value[0x40]) * 2;
        let namespace = value[0x41];
        let name_bytes = value.get(0x42..0x42 + name_len)?;
        let units = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();

        Some(Self {
            parent: LittleEndian::read_u64(&value[0x0..]) & MFT_REFERENCE_MASK,
            namespace,
            name: String::from_utf16_lossy(&units),
        })
    }
}

/// One accepted MFT record.
#[derive(Debug, Clone)]
pub struct MftEntry {
    /// The record number.
    pub id: u64,
    /// Record number of the parent directory.
    pub parent: u64,
    pub name: String,
    /// `None` when the record carries no `$STANDARD_INFORMATION`; the entry
    /// still renders, with empty timestamps.
    pub standard_info: Option<StandardInformation>,
}

/// Decode one record. `None` drops it: wrong magic, truncated data, or no
/// `$FILE_NAME` to place it in the tree with.
pub fn parse(data: &[u8]) -> Option<MftEntry> {
    if data.len() < 0x38 || &data[..4] != RECORD_MAGIC {
        return None;
    }

    let id = u64::from(LittleEndian::read_u32(&data[RECORD_NUMBER_OFFSET..]));
    let mut standard_info = None;
    let mut best_name: Option<FileName> = None;

    let mut offset = usize::from(LittleEndian::read_u16(&data[FIRST_ATTRIBUTE_OFFSET..]));
    while offset + 0x18 <= data.len() {
        let attr_type = LittleEndian::read_u32(&data[offset..]);
        if attr_type == END_MARKER {
            break;
        }

        let attr_len = LittleEndian::read_u32(&data[offset + 0x4..]) as usize;
        if attr_len < 0x18 || offset + attr_len > data.len() {
            break;
        }

        let non_resident = data[offset + 0x8] != 0;
        if !non_resident {
            let value_len = LittleEndian::read_u32(&data[offset + 0x10..]) as usize;
            let value_offset = usize::from(LittleEndian::read_u16(&data[offset + 0x14..]));
            if let Some(value) = value_offset
                .checked_add(value_len)
                .filter(|end| *end <= attr_len)
                .map(|end| &data[offset + value_offset..offset + end])
            {
                match attr_type {
                    STANDARD_INFORMATION => {
                        if standard_info.is_none() {
                            standard_info = StandardInformation::parse(value);
                        }
                    }
                    FILE_NAME => {
                        if let Some(file_name) = FileName::parse(value) {
                            // Prefer a long name over the 8.3 fallback when
                            // a record carries both.
                            let replace = match &best_name {
                                None => true,
                                Some(best) => {
                                    best.namespace == DOS_NAMESPACE
                                        && file_name.namespace != DOS_NAMESPACE
                                }
                            };
                            if replace {
                                best_name = Some(file_name);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        offset += attr_len;
    }

    let file_name = best_name?;

    Some(MftEntry {
        id,
        parent: file_name.parent,
        name: file_name.name,
        standard_info,
    })
}
