#![forbid(unsafe_code)]
//! Error types for the vnode cache.
//!
//! # Error Taxonomy
//!
//! | Class | Type | Propagation |
//! |-------|------|-------------|
//! | Resource exhaustion (pool at capacity) | none | Absorbed: `acquire` blocks, reclaims, then proceeds |
//! | Busy / lock contention | `VnError::Busy` | Absorbed inside the detecting component; surfaced only by explicit admin operations |
//! | Doomed object | `VnError::Unavailable` | Returned to the caller that asked for a new reference |
//! | Write-back failure | `VnError::WriteBack` | Retried; forced paths discard with a warning |
//! | Contract violation | `Violation` | Never returned to callers; raised at an explicit boundary |
//!
//! ## Contract Violations
//!
//! Internal consistency checks return `Result<T, Violation>` so the failing
//! check is visible at every call site (`?`), but a violation is not an
//! ordinary error: once raised, the cache's data structures cannot be
//! trusted. Public entry points convert with [`Violation::raise`], which logs
//! at ERROR and panics. Release builds set `panic = "abort"`, so a raised
//! violation terminates the process.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Busy` | `EBUSY` |
//! | `Unavailable` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidTunable` | `EINVAL` |
//! | `WriteBack` | `EIO` |
//! | `Callback` | `EIO` |

use std::fmt;
use thiserror::Error;

/// Unified error type for vnode cache operations.
#[derive(Debug, Error)]
pub enum VnError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object is locked or in use and cannot be processed right now.
    #[error("busy: {0}")]
    Busy(String),

    /// The vnode is doomed; no new references may be manufactured.
    #[error("vnode {vnode} is doomed")]
    Unavailable { vnode: u64 },

    /// Attaching something that is already present (e.g. a buffer for a
    /// block number the buffer object already owns).
    #[error("already exists: {0}")]
    Exists(String),

    /// Vnode id, mount or tunable key not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted to write a read-only tunable or counter.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// A tunable value failed validation.
    #[error("invalid tunable {key}: {reason}")]
    InvalidTunable { key: String, reason: String },

    /// Writing a dirty buffer back to its filesystem failed.
    #[error("write-back failed for vnode {vnode} block {block}: {detail}")]
    WriteBack {
        vnode: u64,
        block: i64,
        detail: String,
    },

    /// A filesystem callback reported a recoverable failure.
    #[error("{callback} callback failed: {detail}")]
    Callback {
        callback: &'static str,
        detail: String,
    },
}

impl VnError {
    /// Convert into a POSIX errno.
    ///
    /// Exhaustive on purpose: a new variant is a compile error here until it
    /// gets an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Busy(_) => libc::EBUSY,
            Self::Unavailable { .. } | Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::ReadOnly(_) => libc::EROFS,
            Self::InvalidTunable { .. } => libc::EINVAL,
            Self::WriteBack { .. } | Self::Callback { .. } => libc::EIO,
        }
    }

    /// Whether the condition is expected to clear on its own (retry later).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::WriteBack { .. })
    }

    /// Attribute the error to a filesystem callback. Already attributed
    /// errors pass through unchanged.
    #[must_use]
    pub fn in_callback(self, callback: &'static str) -> Self {
        match self {
            Self::Callback { .. } => self,
            other => Self::Callback {
                callback,
                detail: other.to_string(),
            },
        }
    }
}

/// Result alias using `VnError`.
pub type Result<T> = std::result::Result<T, VnError>;

/// Broken internal invariant.
///
/// Carries which check failed and the offending object. See the crate docs
/// for the raise policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub check: &'static str,
    pub vnode: Option<u64>,
    pub detail: String,
}

impl Violation {
    #[must_use]
    pub fn new(check: &'static str, detail: impl Into<String>) -> Self {
        Self {
            check,
            vnode: None,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn on_vnode(mut self, vnode: u64) -> Self {
        self.vnode = Some(vnode);
        self
    }

    /// Cross the fatal boundary.
    pub fn raise(self) -> ! {
        tracing::error!(
            target: "vnc::violation",
            check = self.check,
            vnode = self.vnode,
            detail = %self.detail,
            "contract_violation"
        );
        panic!("{self}");
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vnode {
            Some(vnode) => write!(
                f,
                "contract violation [{}] on vnode {vnode}: {}",
                self.check, self.detail
            ),
            None => write!(f, "contract violation [{}]: {}", self.check, self.detail),
        }
    }
}

impl std::error::Error for Violation {}

/// Check an invariant, producing a [`Violation`] when it does not hold.
///
/// ```
/// use vnc_error::{Violation, ensure};
///
/// fn check(count: u32) -> Result<(), Violation> {
///     ensure(count > 0, "hold_nonzero", || format!("count={count}"))
/// }
/// assert!(check(1).is_ok());
/// assert_eq!(check(0).unwrap_err().check, "hold_nonzero");
/// ```
pub fn ensure(
    cond: bool,
    check: &'static str,
    detail: impl FnOnce() -> String,
) -> std::result::Result<(), Violation> {
    if cond {
        Ok(())
    } else {
        Err(Violation::new(check, detail()))
    }
}

/// Extension for crossing the violation boundary at public entry points.
pub trait OrRaise<T> {
    /// Unwrap, raising the violation if there is one.
    fn or_raise(self) -> T;
}

impl<T> OrRaise<T> for std::result::Result<T, Violation> {
    fn or_raise(self) -> T {
        self.unwrap_or_else(|violation| violation.raise())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(VnError, libc::c_int)> = vec![
            (VnError::Io(std::io::Error::other("test")), libc::EIO),
            (VnError::Busy("locked".into()), libc::EBUSY),
            (VnError::Unavailable { vnode: 7 }, libc::ENOENT),
            (VnError::Exists("block 3".into()), libc::EEXIST),
            (VnError::NotFound("vnode 9".into()), libc::ENOENT),
            (VnError::ReadOnly("live_vnodes".into()), libc::EROFS),
            (
                VnError::InvalidTunable {
                    key: "desired_vnodes".into(),
                    reason: "must be > 0".into(),
                },
                libc::EINVAL,
            ),
            (
                VnError::WriteBack {
                    vnode: 1,
                    block: 2,
                    detail: "EIO".into(),
                },
                libc::EIO,
            ),
            (
                VnError::Callback {
                    callback: "on_inactive",
                    detail: "x".into(),
                },
                libc::EIO,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn callback_attribution_wraps_once() {
        let err = VnError::Busy("inode 7 locked".into()).in_callback("on_inactive");
        assert_eq!(err.to_string(), "on_inactive callback failed: busy: inode 7 locked");
        assert_eq!(err.to_errno(), libc::EIO);
        assert!(!err.is_transient());

        let again = err.in_callback("on_reclaim");
        assert!(matches!(
            again,
            VnError::Callback {
                callback: "on_inactive",
                ..
            }
        ));
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(VnError::Io(raw).to_errno(), libc::ENOSPC);
    }

    #[test]
    fn display_formatting() {
        let err = VnError::WriteBack {
            vnode: 4,
            block: -2,
            detail: "device gone".into(),
        };
        assert_eq!(
            err.to_string(),
            "write-back failed for vnode 4 block -2: device gone"
        );
        assert_eq!(
            VnError::Unavailable { vnode: 11 }.to_string(),
            "vnode 11 is doomed"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(VnError::Busy("x".into()).is_transient());
        assert!(!VnError::Unavailable { vnode: 1 }.is_transient());
        assert!(!VnError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn violation_display_names_the_check() {
        let v = Violation::new("dead_has_no_buffers", "2 dirty buffers").on_vnode(5);
        assert_eq!(
            v.to_string(),
            "contract violation [dead_has_no_buffers] on vnode 5: 2 dirty buffers"
        );
    }

    #[test]
    fn ensure_passes_and_fails() {
        assert!(ensure(true, "ok", || unreachable!()).is_ok());
        let err = ensure(false, "hold_underflow", || "hold=0".to_owned()).unwrap_err();
        assert_eq!(err.check, "hold_underflow");
        assert_eq!(err.detail, "hold=0");
    }

    #[test]
    #[should_panic(expected = "contract violation [double_free]")]
    fn or_raise_panics_on_violation() {
        let res: std::result::Result<(), Violation> =
            Err(Violation::new("double_free", "slot 3"));
        res.or_raise();
    }
}
