//! Run-once teardown.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{AcqError, AcqResult};

/// Components whose teardown may be requested from several threads.
///
/// `dispose` runs cleanup exactly once; later calls are no-ops.
pub trait Dispose: Send + Sync {
    /// Tear the component down. Idempotent.
    fn dispose(&self);

    /// Whether teardown has started.
    fn is_disposed(&self) -> bool;
}

/// Atomic "already torn down" flag embedded in disposable components.
#[derive(Debug, Default)]
pub struct DisposeGuard {
    disposed: AtomicBool,
}

impl DisposeGuard {
    /// A guard that has not been triggered.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            disposed: AtomicBool::new(false),
        }
    }

    /// Mark the component disposed. Returns `true` only for the first caller,
    /// which must then run the teardown.
    #[must_use = "only the first caller may run teardown"]
    pub fn begin(&self) -> bool {
        self.disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether [`begin`](Self::begin) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fail with [`AcqError::Disposed`] once disposed.
    pub fn ensure_not_disposed(&self, component: &str) -> AcqResult<()> {
        if self.is_disposed() {
            Err(AcqError::Disposed(component.to_string()))
        } else {
            Ok(())
        }
    }
}
