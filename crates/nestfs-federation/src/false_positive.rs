//! False positive classification.
//!
//! A mount point whose container turns out not to be an archive is a
//! false positive: operations against it are rerouted to the parent file
//! system, which sees the container as a plain entry. The signal never
//! leaves the federation engine and is deliberately not serializable.

use nestfs_vfs::{FsError, FsResult};

use crate::driver::DriverError;

/// How long a classification is remembered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FalsePositiveKind {
    /// Not remembered; the next operation opens the container again.
    Transient,
    /// Remembered until the next synchronization of the mount point.
    Persistent,
}

/// A mount point classified as not-an-archive, with the failure that
/// caused the classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FalsePositive {
    cause: FsError,
    kind: FalsePositiveKind,
}

impl FalsePositive {
    /// A classification that must be checked again next time.
    pub fn transient(cause: FsError) -> Self {
        Self {
            cause,
            kind: FalsePositiveKind::Transient,
        }
    }

    /// A classification cached until the next synchronization.
    pub fn persistent(cause: FsError) -> Self {
        Self {
            cause,
            kind: FalsePositiveKind::Persistent,
        }
    }

    /// The originating failure.
    pub fn cause(&self) -> &FsError {
        &self.cause
    }

    /// Transient or persistent.
    pub fn kind(&self) -> FalsePositiveKind {
        self.kind
    }

    /// Check if the classification is cached on the controller.
    pub fn is_persistent(&self) -> bool {
        self.kind == FalsePositiveKind::Persistent
    }
}

impl std::fmt::Display for FalsePositive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "false positive archive ({:?}): {}", self.kind, self.cause)
    }
}

/// Result of applying an operation to the local archive model.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    /// The operation succeeded locally.
    Ok(T),
    /// The mount point is a false positive; delegate to the parent.
    Reroute(FalsePositive),
    /// A genuine failure for the caller.
    Fatal(FsError),
}

impl<T> From<FsResult<T>> for Outcome<T> {
    fn from(result: FsResult<T>) -> Self {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

impl<T> From<Result<T, DriverError>> for Outcome<T> {
    fn from(result: Result<T, DriverError>) -> Self {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(DriverError::NotAnArchive { cause, retryable }) => {
                Outcome::Reroute(if retryable {
                    FalsePositive::transient(cause)
                } else {
                    FalsePositive::persistent(cause)
                })
            }
            Err(DriverError::Fs(e)) => Outcome::Fatal(e),
        }
    }
}
