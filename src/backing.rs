//! Walks a control area's subsection chain and turns its prototype-PTE
//! arrays into physical byte ranges of file content.
//!
//! Every subsection maps a contiguous run of file sectors; each entry of its
//! PTE array stands for one page worth of those sectors. The walker is
//! strictly best-effort: an entry that doesn't resolve, corrupt sector
//! counts or an out-of-range physical address all degrade to "no byte range
//! for this page" and the walk carries on.
use std::collections::HashSet;

use crate::addr::{Addr, Pa, Va, PAGE_SIZE};
use crate::object::{ObjectReader, Subsection};
use crate::pte::Pte;
use crate::space::{KernelSpace, PhysicalSpace};

/// Disk sector size the cache manager's sector counts are expressed in.
pub const SECTOR_SIZE: u64 = 512;

/// File sectors one PTE-mapped page accounts for.
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE / SECTOR_SIZE;

/// One physically-backed range of file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Where the bytes are in the physical snapshot.
    pub phys: Pa,
    /// Byte offset within the file.
    pub file_offset: u64,
    /// Length in bytes.
    pub len: u64,
}

/// Lazily yields the [`MappedRange`]s of one control area, in chain order.
pub struct BackingWalker<'a> {
    reader: &'a ObjectReader<'a>,
    phys: &'a dyn PhysicalSpace,
    current: Option<Subsection>,
    pte_idx: u32,
    /// Subsections already visited, so a corrupt `NextSubsection` link can't
    /// spin the walk forever.
    visited: HashSet<Va>,
}

impl<'a> BackingWalker<'a> {
    /// Start walking the subsections behind `control_area`.
    pub fn new(
        reader: &'a ObjectReader<'a>,
        phys: &'a dyn PhysicalSpace,
        control_area: Va,
    ) -> Self {
        let mut visited = HashSet::new();
        let current = reader
            .first_subsection(control_area)
            .and_then(|va| Self::load(reader, va, &mut visited));

        Self {
            reader,
            phys,
            current,
            pte_idx: 0,
            visited,
        }
    }

    /// Decode the subsection at `va`, unless it is null, already seen, or
    /// unreadable.
    fn load(
        reader: &ObjectReader<'_>,
        va: Va,
        visited: &mut HashSet<Va>,
    ) -> Option<Subsection> {
        if va.is_null() || !visited.insert(va) {
            return None;
        }

        reader.subsection(va)
    }

    /// Move on to the next subsection of the chain.
    fn advance(&mut self) {
        let next = self.current.map(|s| s.next).unwrap_or_default();
        self.current = Self::load(self.reader, next, &mut self.visited);
        self.pte_idx = 0;
    }

    /// Decode one PTE word down to a physical page address. Resolution goes
    /// through the address space's prototype capability when it has one;
    /// otherwise only the raw valid bit is honored.
    fn page_address(&self, pte: Pte) -> Option<Pa> {
        match self.reader.kernel().proto_resolver() {
            Some(resolver) => resolver.resolve(pte),
            None => pte.valid().then(|| pte.page_base()),
        }
    }
}

impl Iterator for BackingWalker<'_> {
    type Item = MappedRange;

    fn next(&mut self) -> Option<MappedRange> {
        loop {
            let sub = self.current?;
            if self.pte_idx >= sub.ptes_in_subsection {
                self.advance();
                continue;
            }

            let i = u64::from(self.pte_idx);
            self.pte_idx += 1;

            let Some(pte_va) = sub.pte_base.u64().checked_add(i * 8).map(Va::new) else {
                self.advance();
                continue;
            };

            let Some(word) = self.reader.kernel().read_u64(pte_va) else {
                continue;
            };

            let Some(pa) = self.page_address(Pte::from(word)) else {
                continue;
            };

            // Not every sector of the last page is necessarily mapped; clamp
            // to what the subsection declares, and treat an overrun (the PTE
            // array being longer than the declared sectors) as corrupt.
            let consumed_sectors = i * SECTORS_PER_PAGE;
            let declared_sectors = u64::from(sub.number_of_full_sectors);
            if declared_sectors <= consumed_sectors {
                continue;
            }

            let mapped_sectors = SECTORS_PER_PAGE.min(declared_sectors - consumed_sectors);

            if pa.u64() >= self.phys.extent() {
                continue;
            }

            let file_sector = u64::from(sub.starting_sector) + consumed_sectors;

            return Some(MappedRange {
                phys: pa,
                file_offset: file_sector * SECTOR_SIZE,
                len: mapped_sectors * SECTOR_SIZE,
            });
        }
    }
}
