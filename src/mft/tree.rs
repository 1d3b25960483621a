//! Rebuilds the filesystem's directory hierarchy from nothing but the MFT
//! records the cache manager happened to keep resident.
//!
//! The table is sparse by nature: most of the MFT is usually paged out, and
//! the parent graph of what's left can be orphaned or, on a corrupted image,
//! cyclic. Lookups return `Option`, the traversal carries one seen-set
//! across every root so no id ever renders twice, and the recursion is an
//! explicit worklist so adversarial depth can't blow the stack.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};

use crate::addr::{Addr, Va};
use crate::object::ObjectReader;
use crate::progress::Progress;
use crate::space::KernelSpace;
use crate::vacb::{VacbEnumerator, VACB_WINDOW};

use super::record::{self, MftEntry, RECORD_SIZE};

/// The well-known id the directory tree is rooted at.
pub const ROOT_ID: u64 = 2;

/// The name the `$MFT` stream's file object carries.
pub const MFT_FILE_NAME: &str = r"\$Mft";

/// One row of the tree listing, pre-order with `depth` tracking the
/// indentation level.
#[derive(Debug, Clone)]
pub struct TreeRow {
    pub id: u64,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub name: String,
    pub depth: usize,
}

fn stamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map_or_else(|| "-".to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
}

impl Display for TreeRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>5} {:19} {:19} {:19} {:19} {:indent$}{}",
            self.id,
            stamp(self.modified),
            stamp(self.mft_modified),
            stamp(self.accessed),
            stamp(self.created),
            "",
            self.name,
            indent = self.depth * 2
        )
    }
}

/// A sparse id → entry mapping plus the parent → children adjacency built
/// from it.
#[derive(Debug, Default)]
pub struct MftTable {
    entries: BTreeMap<u64, MftEntry>,
    tree: BTreeMap<u64, BTreeSet<u64>>,
}

impl MftTable {
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(ROOT_ID, BTreeSet::new());

        Self {
            entries: BTreeMap::new(),
            tree,
        }
    }

    /// Decode one raw record and register it. Returns the accepted record's
    /// id; malformed and unallocated records contribute nothing.
    pub fn insert_record(&mut self, data: &[u8]) -> Option<u64> {
        let entry = record::parse(data)?;
        let id = entry.id;
        self.tree.entry(entry.parent).or_default().insert(id);
        self.entries.insert(id, entry);

        Some(id)
    }

    /// Look an id up; absent ids are absent, not an error.
    pub fn entry(&self, id: u64) -> Option<&MftEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Direct children of `id`, ascending.
    pub fn children(&self, id: u64) -> impl Iterator<Item = u64> + '_ {
        self.tree.get(&id).into_iter().flatten().copied()
    }

    /// Render the hierarchy: pre-order from every known parent key in
    /// ascending order, children ascending, every id at most once even when
    /// the parent graph cycles.
    pub fn rows(&self) -> Vec<TreeRow> {
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for &root in self.tree.keys() {
            let mut stack = vec![(root, 0usize)];
            while let Some((id, depth)) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }

                // No decoded entry for this id: the whole branch is dropped,
                // the traversal isn't.
                let Some(entry) = self.entries.get(&id) else {
                    continue;
                };

                rows.push(TreeRow {
                    id,
                    modified: entry.standard_info.map(|si| si.modified),
                    mft_modified: entry.standard_info.map(|si| si.mft_modified),
                    accessed: entry.standard_info.map(|si| si.accessed),
                    created: entry.standard_info.map(|si| si.created),
                    name: entry.name.clone(),
                    depth,
                });

                // Reversed so the smallest child pops first.
                if let Some(children) = self.tree.get(&id) {
                    for &child in children.iter().rev() {
                        if !seen.contains(&child) {
                            stack.push((child, depth + 1));
                        }
                    }
                }
            }
        }

        rows
    }
}

/// Locate the `$Mft` stream's cache blocks and decode every resident record
/// out of them.
pub fn scan_mft(reader: &ObjectReader<'_>, progress: &dyn Progress) -> MftTable {
    let mut table = MftTable::new();
    for vacb in VacbEnumerator::new(reader, progress) {
        if vacb.shared_cache_map.is_null() {
            continue;
        }

        let Some(file_object) = reader
            .shared_cache_map_file_object(vacb.shared_cache_map)
            .and_then(|va| reader.file_object(va))
        else {
            continue;
        };

        if file_object.name != MFT_FILE_NAME {
            continue;
        }

        let mut buf = [0u8; RECORD_SIZE];
        for record_offset in (0..VACB_WINDOW).step_by(RECORD_SIZE) {
            let Some(record_va) = vacb.base.u64().checked_add(record_offset).map(Va::new) else {
                break;
            };

            // A record straddling a paged-out page just doesn't decode.
            if reader.kernel().read_exact(record_va, &mut buf).is_none() {
                continue;
            }

            if let Some(id) = table.insert_record(&buf) {
                if let Some(entry) = table.entry(id) {
                    progress.report(&format!("Added: {}", entry.name));
                }
            }
        }
    }

    table
}
