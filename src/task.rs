//! The process boundary. Task / handle-table enumeration belongs to whatever
//! hosts this crate; the reconstruction pipeline only needs each task to hand
//! over the `_SUBSECTION` addresses its VAD tree references and the entries
//! of its handle table.
use crate::addr::Va;

/// The object-kind label handle tables attach to `File` objects.
pub const FILE_HANDLE_KIND: &str = "File";

/// One handle-table entry.
#[derive(Debug, Clone)]
pub struct Handle {
    /// Object kind label, e.g. `File`, `Key`, `Event`.
    pub kind: String,
    /// Address of the object body.
    pub object: Va,
}

/// One task (process) of the snapshotted machine.
pub trait Task {
    /// A short display name for progress reporting.
    fn name(&self) -> String;

    /// Addresses of every `_SUBSECTION` reachable from the task's VAD tree.
    fn vad_subsections(&self) -> Vec<Va>;

    /// The task's open handles.
    fn handles(&self) -> Vec<Handle>;
}
