//! Enumeration of every block cached by the cache manager.
//!
//! The cache manager keeps file content resident in 256 KB windows described
//! by `_VACB` structures. Two historical layouts of the bookkeeping exist:
//! XP-era kernels keep one flat array of slots (`CcVacbs` /
//! `CcNumberVacbs`), newer kernels keep an array of per-table headers each
//! followed by its slots (`CcVacbArrays` / `CcVacbArraysAllocated`). The
//! [`VacbEnumerator`] hides both behind one lazy sequence; which layout is in
//! play is decided exactly once, by probing whether the legacy global
//! resolves to a non-null pointer.
use std::fmt::{self, Display};

use crate::addr::{Addr, Va};
use crate::object::{ObjectReader, RawVacb};
use crate::profile::{CC_NUMBER_VACBS, CC_VACBS, CC_VACB_ARRAYS, CC_VACB_ARRAYS_ALLOCATED};
use crate::progress::Progress;
use crate::space::KernelSpace;

/// The span of file content one VACB controls.
pub const VACB_WINDOW: u64 = 0x40_000;

/// Cursor into the table currently being scanned (newer layout only).
#[derive(Debug, Clone, Copy)]
struct TableCursor {
    /// The `_VACB_ARRAY_HEADER` this table starts with.
    table: Va,
    slot: u32,
}

/// The layout strategy, fixed at construction.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    /// Neither layout's globals resolved; the sequence is empty.
    Absent,
    /// XP-era flat array. Every readable slot is emitted, the legacy layout
    /// has no stale-entry problem.
    Legacy { array: Va, count: u32, next: u32 },
    /// Win7+ array of pointers to per-table headers. Slots are emitted only
    /// when their back-reference matches the table they sit in.
    Tables {
        arrays: Va,
        count: u32,
        next_table: u32,
        cursor: Option<TableCursor>,
    },
}

/// A lazy, restartable walk over every valid VACB of the snapshot. Nothing
/// is cached across instances; build a fresh one for every query.
pub struct VacbEnumerator<'a> {
    reader: &'a ObjectReader<'a>,
    progress: &'a dyn Progress,
    strategy: Strategy,
}

/// Address of slot `idx` in a flat run of `_VACB`s starting at `first_slot`.
fn slot_va(first_slot: Va, idx: u32, slot_size: u64) -> Option<Va> {
    first_slot
        .u64()
        .checked_add(u64::from(idx).checked_mul(slot_size)?)
        .map(Va::new)
}

impl<'a> VacbEnumerator<'a> {
    pub fn new(reader: &'a ObjectReader<'a>, progress: &'a dyn Progress) -> Self {
        Self {
            reader,
            progress,
            strategy: Self::probe(reader),
        }
    }

    /// Decide which layout this kernel uses. The legacy global resolving to
    /// a non-null array pointer selects the legacy path; otherwise the
    /// multi-table globals are consulted. Unresolved globals mean "not
    /// present on this kernel" and select the empty sequence.
    fn probe(reader: &ObjectReader<'_>) -> Strategy {
        let profile = reader.profile();
        let kernel = reader.kernel();

        if let Some(array) = profile.global(CC_VACBS).and_then(|g| kernel.read_ptr(g)) {
            let count = profile
                .global(CC_NUMBER_VACBS)
                .and_then(|g| kernel.read_u32(g))
                .unwrap_or(0);

            return Strategy::Legacy {
                array,
                count,
                next: 0,
            };
        }

        let Some(arrays) = profile
            .global(CC_VACB_ARRAYS)
            .and_then(|g| kernel.read_ptr(g))
        else {
            return Strategy::Absent;
        };

        let count = profile
            .global(CC_VACB_ARRAYS_ALLOCATED)
            .and_then(|g| kernel.read_u32(g))
            .unwrap_or(0);

        Strategy::Tables {
            arrays,
            count,
            next_table: 0,
            cursor: None,
        }
    }
}

impl Iterator for VacbEnumerator<'_> {
    type Item = RawVacb;

    fn next(&mut self) -> Option<RawVacb> {
        let reader = self.reader;
        let vacb_size = reader.profile().layouts.vacb.size;

        loop {
            match &mut self.strategy {
                Strategy::Absent => return None,
                Strategy::Legacy { array, count, next } => {
                    if next >= count {
                        return None;
                    }

                    let idx = *next;
                    *next += 1;
                    // Overflowing slot arithmetic means the globals were
                    // garbage; call the walk off.
                    let Some(slot) = slot_va(*array, idx, vacb_size) else {
                        return None;
                    };

                    if let Some(vacb) = reader.vacb(slot) {
                        return Some(vacb);
                    }
                }
                Strategy::Tables {
                    arrays,
                    count,
                    next_table,
                    cursor,
                } => {
                    let header_size = reader.profile().layouts.vacb_array.size;
                    let slots_per_table = reader.profile().layouts.vacb_array.slots_per_table;

                    if let Some(c) = cursor {
                        if c.slot < slots_per_table {
                            let idx = c.slot;
                            c.slot += 1;
                            let table = c.table;
                            let first_slot = Va::new(table.u64().saturating_add(header_size));
                            let Some(slot) = slot_va(first_slot, idx, vacb_size) else {
                                *cursor = None;
                                continue;
                            };

                            let Some(vacb) = reader.vacb(slot) else {
                                continue;
                            };

                            // Reallocation leaves slots behind that have not
                            // been claimed by this table yet; the
                            // back-reference is the ownership proof.
                            if vacb.array_head != table {
                                continue;
                            }

                            return Some(vacb);
                        }

                        *cursor = None;
                    }

                    if next_table >= count {
                        return None;
                    }

                    let idx = *next_table;
                    *next_table += 1;
                    let Some(entry) = arrays.u64().checked_add(u64::from(idx) * 8).map(Va::new)
                    else {
                        return None;
                    };

                    // A null or unreadable table pointer is skipped, not
                    // fatal.
                    let Some(table) = reader.kernel().read_ptr(entry) else {
                        continue;
                    };

                    let table_index = reader.vacb_array_index(table).unwrap_or(idx);
                    self.progress
                        .report(&format!("Scanning VACB table {table_index}"));
                    *cursor = Some(TableCursor { table, slot: 0 });
                }
            }
        }
    }
}

/// One row of the VACB listing.
#[derive(Debug, Clone)]
pub struct VacbRow {
    /// Address of the `_VACB` itself.
    pub vacb: Va,
    /// Whether the window's base currently translates.
    pub valid: bool,
    /// Virtual base of the 256 KB window.
    pub base: Va,
    /// File offset the window maps.
    pub file_offset: u64,
    /// Device-qualified name of the owning file.
    pub filename: String,
}

impl Display for VacbRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#018x} {:7} {:#018x} {:#010x} {}",
            self.vacb.u64(),
            self.valid,
            self.base.u64(),
            self.file_offset,
            self.filename
        )
    }
}

/// Produce the `vacbs` listing: one row per enumerated VACB that belongs to
/// a named file stream.
pub fn list_vacbs<'a>(
    reader: &'a ObjectReader<'a>,
    progress: &'a dyn Progress,
) -> impl Iterator<Item = VacbRow> + 'a {
    VacbEnumerator::new(reader, progress).filter_map(move |vacb| {
        if vacb.shared_cache_map.is_null() {
            return None;
        }

        let file_object = reader.shared_cache_map_file_object(vacb.shared_cache_map)?;
        let file_object = reader.file_object(file_object)?;
        let filename = file_object.name_with_device();
        if filename.is_empty() {
            return None;
        }

        Some(VacbRow {
            vacb: vacb.va,
            valid: reader.kernel().vtop(vacb.base).is_some(),
            base: vacb.base,
            file_offset: vacb.file_offset,
            filename,
        })
    })
}
