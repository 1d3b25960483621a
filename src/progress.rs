//! Progress notifications. Long scans call into an injectable [`Progress`]
//! sink at well-defined points (per VACB table, per task, per dumped file)
//! instead of printing anywhere themselves.

/// A progress sink. Notifications are purely informational; implementations
/// must not assume any particular ordering stays stable across versions.
pub trait Progress {
    fn report(&self, message: &str);
}

/// Swallows everything. The default for library consumers that don't care.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&self, _message: &str) {}
}
