//! Directory iteration and VFAT long-filename reassembly.
//!
//! A handler only gets one call at a time, so the directory-iteration
//! state lives on [`DirCursor`] and is driven forward one logical entry
//! per call to [`read_next_entry`], rather than on a long-lived iterator
//! that owns a cursor across calls.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::block_device::BlockDevice;
use crate::bpb::Geometry;
use crate::entry::{LongDirEntry, ShortDirEntry};
use crate::fat::{next_cluster, read_cluster, NextCluster};
use crate::name::{decode_datetime, decode_date, decode_short_name, Timestamp};
use crate::{Fat32Error, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_READ_ONLY, ATTR_SYSTEM, DIRENT_SIZE, LAST_LONG_ENTRY};

const LFN_BUFFER_LEN: usize = 256;

/// Sequential reading position within a directory's cluster chain.
///
/// `active_cluster = None` means the chain is exhausted, modeled with
/// `Option` instead of a signed sentinel value since cluster numbers are
/// otherwise always valid `u32`s.
pub struct DirCursor {
    pub active_cluster: Option<u32>,
    pub buffer: Vec<u8>,
    pub buffer_offset: usize,
}

impl DirCursor {
    /// Begins iterating the directory whose first cluster is
    /// `start_cluster`, eagerly reading its first cluster into the owned
    /// buffer.
    pub fn open(
        device: &dyn BlockDevice,
        geometry: &Geometry,
        start_cluster: u32,
    ) -> Result<DirCursor, Fat32Error> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(geometry.bytes_per_cluster as usize)
            .map_err(|_| Fat32Error::OutOfMemory)?;
        buffer.resize(geometry.bytes_per_cluster as usize, 0);
        read_cluster(device, geometry, start_cluster, &mut buffer)?;
        Ok(DirCursor { active_cluster: Some(start_cluster), buffer, buffer_offset: 0 })
    }
}

/// A logical directory entry, decoded and ready to hand to a client.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub system: bool,
    pub size: u32,
    pub first_cluster: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
    /// Date-only; FAT32 stores no access time.
    pub accessed: Timestamp,
}

/// Advances `cursor` to the next cluster in its chain, or marks it
/// exhausted if the chain has ended. Shared by both "ran off the end of
/// the buffer" and "saw a `0x00` terminator" advance points below.
fn advance_cluster(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    cursor: &mut DirCursor,
) -> Result<bool, Fat32Error> {
    let current = match cursor.active_cluster {
        Some(c) => c,
        None => return Ok(false),
    };
    match next_cluster(device, geometry, current)? {
        NextCluster::EndOfChain => {
            cursor.active_cluster = None;
            Ok(false)
        }
        NextCluster::Cluster(next) => {
            read_cluster(device, geometry, next, &mut cursor.buffer)?;
            cursor.active_cluster = Some(next);
            cursor.buffer_offset = 0;
            Ok(true)
        }
    }
}

struct LfnAssembly {
    buffer: [u8; LFN_BUFFER_LEN],
    cursor: i32,
    seen_any: bool,
    truncated: bool,
    checksum: Option<u8>,
}

impl LfnAssembly {
    fn new() -> LfnAssembly {
        LfnAssembly {
            buffer: [0u8; LFN_BUFFER_LEN],
            cursor: 254,
            seen_any: false,
            truncated: false,
            checksum: None,
        }
    }

    /// Prepends one long-name record's code units, in reverse: records are
    /// encountered tail-chunk-first on disk, so writing each record's
    /// characters in reverse order ahead of the previously written (later)
    /// chunk reconstructs the name in forward order.
    fn consume(&mut self, lde: &LongDirEntry) {
        self.seen_any = true;
        if self.checksum.is_none() {
            self.checksum = Some(lde.checksum);
        }
        let units = lde.code_units();
        let valid_len = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        for &unit in units[..valid_len].iter().rev() {
            if self.truncated {
                break;
            }
            if self.cursor < 0 {
                self.truncated = true;
                break;
            }
            self.buffer[self.cursor as usize] = unit as u8;
            self.cursor -= 1;
        }
    }

    /// The reconstructed name, valid only when [`LfnAssembly::seen_any`]
    /// is true and truncation did not occur; callers fall back to the
    /// anchoring short name otherwise.
    fn into_name(self) -> String {
        let start = (self.cursor + 1) as usize;
        let mut name = String::with_capacity(LFN_BUFFER_LEN - start);
        for &b in &self.buffer[start..] {
            if b == 0 {
                break;
            }
            name.push(b as char);
        }
        name
    }
}

/// Reads the next logical entry from `cursor`, or `None` once the
/// directory's cluster chain is exhausted.
pub fn read_next_entry(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    cursor: &mut DirCursor,
) -> Result<Option<DirEntry>, Fat32Error> {
    let mut lfn = LfnAssembly::new();

    let short = loop {
        if cursor.active_cluster.is_none() {
            return Ok(None);
        }
        if cursor.buffer_offset + DIRENT_SIZE > cursor.buffer.len() {
            if !advance_cluster(device, geometry, cursor)? {
                return Ok(None);
            }
            continue;
        }

        let record = &cursor.buffer[cursor.buffer_offset..cursor.buffer_offset + DIRENT_SIZE];
        let record: [u8; DIRENT_SIZE] = record.try_into().unwrap();
        cursor.buffer_offset += DIRENT_SIZE;

        let short = ShortDirEntry::decode(&record);
        if short.is_end_marker() {
            if !advance_cluster(device, geometry, cursor)? {
                return Ok(None);
            }
            continue;
        }
        if short.is_long_name() {
            lfn.consume(&LongDirEntry::decode(&record));
            continue;
        }
        break short;
    };

    let first_cluster = short.first_cluster();
    let size = short.file_size;
    let attr = short.attr;

    let use_lfn = lfn.seen_any && !lfn.truncated;
    if lfn.seen_any && !lfn.truncated {
        if let Some(checksum) = lfn.checksum {
            if checksum != short.short_name_checksum() {
                log::warn!("LFN checksum mismatch reconstructing directory entry");
            }
        }
    }
    let name = if use_lfn {
        lfn.into_name()
    } else {
        decode_short_name(&short.name_raw)
    };

    Ok(Some(DirEntry {
        name,
        is_dir: attr & ATTR_DIRECTORY != 0,
        read_only: attr & ATTR_READ_ONLY != 0,
        hidden: attr & ATTR_HIDDEN != 0,
        system: attr & ATTR_SYSTEM != 0,
        size,
        first_cluster,
        created: decode_datetime(short.crt_date, short.crt_time),
        modified: decode_datetime(short.wrt_date, short.wrt_time),
        accessed: decode_date(short.lst_acc_date),
    }))
}
