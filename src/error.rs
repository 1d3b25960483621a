//! This is the error type used across the codebase.
//!
//! It is deliberately small: snapshot anomalies are not errors here. A page
//! that fails to translate, a stale VACB slot or a corrupt subsection all
//! degrade to "skip the unit" and surface as `Option`s / empty sequences.
//! What's left is I/O on the snapshot or the output streams, and a profile
//! that is broken before any scan starts.
use std::io;

use thiserror::Error;

pub type Result<R> = std::result::Result<R, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid profile: {0}")]
    InvalidProfile(&'static str),
}
