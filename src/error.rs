use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KObjCacheError {
    /// A preprocessor or compiler child failed. The cache must not be
    /// updated, and the child's exit code becomes ours.
    #[error("{what} child failed: {status}")]
    ChildFailed {
        what: &'static str,
        status: ExitStatus,
    },
}

impl KObjCacheError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // A signal death has no exit code; report plain failure.
            KObjCacheError::ChildFailed { status, .. } => status.code().unwrap_or(1),
        }
    }
}
