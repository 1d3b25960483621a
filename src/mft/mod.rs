//! Everything `$MFT`: record decoding and the directory-tree rebuild.
mod record;
mod tree;

pub use record::{MftEntry, StandardInformation, RECORD_SIZE};
pub use tree::{scan_mft, MftTable, TreeRow, MFT_FILE_NAME, ROOT_ID};
