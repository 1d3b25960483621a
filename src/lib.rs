#![allow(clippy::doc_markdown)]
#![doc = include_str!("../README.md")]
mod addr;
mod backing;
mod dump;
mod error;
mod mft;
mod object;
mod profile;
mod progress;
mod pte;
mod space;
mod task;
#[cfg(test)]
mod testutil;
mod vacb;

pub use addr::{Addr, Pa, Va, PAGE_SIZE};
pub use backing::{BackingWalker, MappedRange, SECTORS_PER_PAGE, SECTOR_SIZE};
pub use dump::{DumpRow, FileDumper, SourceKind};
pub use error::{Error, Result};
pub use mft::{
    scan_mft, MftEntry, MftTable, StandardInformation, TreeRow, MFT_FILE_NAME, RECORD_SIZE,
    ROOT_ID,
};
pub use object::{FileObject, ObjectReader, RawVacb, Subsection};
pub use profile::{
    Layouts, Profile, CC_NUMBER_VACBS, CC_VACBS, CC_VACB_ARRAYS, CC_VACB_ARRAYS_ALLOCATED,
};
pub use progress::{NullProgress, Progress};
pub use pte::{Pte, PteFlags, PTE_PFN_MASK};
pub use space::{KernelSpace, PhysicalSpace, ProtoPteResolver, RawImage, X64Space};
pub use task::{Handle, Task, FILE_HANDLE_KIND};
pub use vacb::{list_vacbs, VacbEnumerator, VacbRow, VACB_WINDOW};
