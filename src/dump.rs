//! Reconstructs file content out of the snapshot.
//!
//! Candidate file objects are discovered from two directions per task —
//! subsections referenced by the VAD tree and `File` entries of the handle
//! table — then every candidate gets one sparse output stream fed from up to
//! three sources: the image-section backing store, the data-section backing
//! store, and the cache manager's resident VACB windows. Writes are keyed by
//! absolute file offset, so a later source legitimately overwrites an
//! earlier one where the cache copy is more current than the backing store.
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::addr::{Addr, Pa, Va, PAGE_SIZE};
use crate::backing::BackingWalker;
use crate::error::Result;
use crate::object::{ObjectReader, RawVacb};
use crate::progress::{NullProgress, Progress};
use crate::space::{KernelSpace, PhysicalSpace};
use crate::task::{Task, FILE_HANDLE_KIND};
use crate::vacb::{VacbEnumerator, VACB_WINDOW};

/// Which of the three sources a dumped range came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    ImageSection,
    DataSection,
    Vacb,
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::ImageSection => "ImageSectionObject",
            SourceKind::DataSection => "DataSectionObject",
            SourceKind::Vacb => "VACB",
        })
    }
}

/// One row of the dump listing: a range of file content that was found
/// resident and written out.
#[derive(Debug, Clone)]
pub struct DumpRow {
    pub source: SourceKind,
    pub phys: Pa,
    pub file_offset: u64,
    pub len: u64,
    pub filename: String,
}

impl Display for DumpRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:20} {:#014x} {:#010x} {:#07x} {}",
            self.source.to_string(),
            self.phys.u64(),
            self.file_offset,
            self.len,
            self.filename
        )
    }
}

/// Turn a device-qualified kernel path into a flat output filename.
fn normalize_filename(name: &str) -> String {
    name.replace(['\\', '/'], "_")
}

/// The file reconstruction pipeline. One instance per output directory; run
/// it as many times as you like, the snapshot never changes under it.
pub struct FileDumper<'a> {
    reader: &'a ObjectReader<'a>,
    phys: &'a dyn PhysicalSpace,
    out_dir: PathBuf,
    progress: &'a dyn Progress,
}

impl<'a> FileDumper<'a> {
    pub fn new(
        reader: &'a ObjectReader<'a>,
        phys: &'a dyn PhysicalSpace,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reader,
            phys,
            out_dir: out_dir.into(),
            progress: &NullProgress,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Reconstruct every candidate file. `explicit` short-circuits
    /// discovery: a non-empty list of `_FILE_OBJECT` addresses is dumped as
    /// given. Returns the ordered row stream; the recovered bytes land in
    /// the output directory as a side effect.
    pub fn run(&self, tasks: &[&dyn Task], explicit: &[Va]) -> Result<Vec<DumpRow>> {
        let candidates = if explicit.is_empty() {
            self.discover(tasks)
        } else {
            explicit.to_vec()
        };

        let vacbs_by_cache_map = self.group_vacbs();
        std::fs::create_dir_all(&self.out_dir)?;

        let mut rows = Vec::new();
        let mut seen_filenames = HashSet::new();
        for candidate in candidates {
            let Some(file_object) = self.reader.file_object(candidate) else {
                continue;
            };

            let filename = normalize_filename(&file_object.name_with_device());
            // Nameless objects, and the two names that would escape the
            // output directory, have nowhere to go.
            if filename.is_empty() || filename == "." || filename == ".." {
                continue;
            }

            // Two distinct file objects can normalize to the same name; the
            // first one seen claims the output stream, later ones are
            // dropped whole.
            if !seen_filenames.insert(filename.clone()) {
                continue;
            }

            self.progress.report(&format!("Dumping {filename}"));
            let mut out = File::create(self.out_dir.join(&filename))?;

            // Image and data sections are independent backing views of the
            // same file; both get dumped when both exist.
            if let Some(control_area) = file_object.image_section {
                self.dump_backing(control_area, SourceKind::ImageSection, &filename, &mut out, &mut rows)?;
            }

            if let Some(control_area) = file_object.data_section {
                self.dump_backing(control_area, SourceKind::DataSection, &filename, &mut out, &mut rows)?;
            }

            // Augment with whatever the cache manager holds resident.
            if let Some(cache_map) = file_object.shared_cache_map {
                for vacb in vacbs_by_cache_map.get(&cache_map).into_iter().flatten() {
                    self.dump_vacb(vacb, &filename, &mut out, &mut rows)?;
                }
            }
        }

        Ok(rows)
    }

    /// Collect candidate file objects across all tasks: subsection owners
    /// found in the VAD trees, plus `File` handles. Deduplicated by object
    /// address, discovery order preserved.
    fn discover(&self, tasks: &[&dyn Task]) -> Vec<Va> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for task in tasks {
            self.progress
                .report(&format!("Inspecting VAD for {}", task.name()));
            for subsection in task.vad_subsections() {
                if let Some(file_object) = self.reader.subsection_file_object(subsection) {
                    if seen.insert(file_object) {
                        candidates.push(file_object);
                    }
                }
            }

            self.progress
                .report(&format!("Inspecting Handles for {}", task.name()));
            for handle in task.handles() {
                if handle.kind == FILE_HANDLE_KIND && seen.insert(handle.object) {
                    candidates.push(handle.object);
                }
            }
        }

        candidates
    }

    /// Run the enumerator once and bucket every block by its cache-map key.
    /// Blocks with a null key belong to no file stream and are discarded.
    fn group_vacbs(&self) -> HashMap<Va, Vec<RawVacb>> {
        let mut by_cache_map: HashMap<Va, Vec<RawVacb>> = HashMap::new();
        for vacb in VacbEnumerator::new(self.reader, self.progress) {
            if vacb.shared_cache_map.is_null() {
                continue;
            }

            by_cache_map
                .entry(vacb.shared_cache_map)
                .or_default()
                .push(vacb);
        }

        by_cache_map
    }

    fn dump_backing(
        &self,
        control_area: Va,
        source: SourceKind,
        filename: &str,
        out: &mut File,
        rows: &mut Vec<DumpRow>,
    ) -> Result<()> {
        for range in BackingWalker::new(self.reader, self.phys, control_area) {
            rows.push(DumpRow {
                source,
                phys: range.phys,
                file_offset: range.file_offset,
                len: range.len,
                filename: filename.to_string(),
            });

            self.write_range(out, range.phys, range.file_offset, range.len)?;
        }

        Ok(())
    }

    /// Split the 256 KB window into pages and keep the ones that still
    /// translate.
    fn dump_vacb(
        &self,
        vacb: &RawVacb,
        filename: &str,
        out: &mut File,
        rows: &mut Vec<DumpRow>,
    ) -> Result<()> {
        for window_offset in (0..VACB_WINDOW).step_by(PAGE_SIZE as usize) {
            let Some(page_va) = vacb.base.u64().checked_add(window_offset).map(Va::new) else {
                break;
            };

            let Some(pa) = self.reader.kernel().vtop(page_va) else {
                continue;
            };

            let Some(file_offset) = vacb.file_offset.checked_add(window_offset) else {
                break;
            };

            rows.push(DumpRow {
                source: SourceKind::Vacb,
                phys: pa,
                file_offset,
                len: PAGE_SIZE,
                filename: filename.to_string(),
            });

            self.write_range(out, pa, file_offset, PAGE_SIZE)?;
        }

        Ok(())
    }

    /// Sparse write: seek to the file offset, write whatever the snapshot
    /// actually backs. Unwritten holes stay holes.
    fn write_range(&self, out: &mut File, pa: Pa, file_offset: u64, len: u64) -> Result<()> {
        let mut buf = vec![0; usize::try_from(len).unwrap_or(0)];
        let amount = self.phys.read(pa, &mut buf).unwrap_or(0);
        if amount > 0 {
            out.seek(SeekFrom::Start(file_offset))?;
            out.write_all(&buf[..amount])?;
        }

        Ok(())
    }
}
