//! A resource that is rebuilt from a name and swapped under one lock.

use parking_lot::Mutex;
use std::io;

type Builder<T> = Box<dyn Fn(&str) -> io::Result<T> + Send + Sync>;

/// Holds at most one `T` built from a name.
///
/// Replacement, clearing and every access happen under the same lock, so a
/// writer never sees a value that is being torn down.
pub struct SyncSwapValue<T> {
    value: Mutex<Option<T>>,
    builder: Builder<T>,
}

impl<T> SyncSwapValue<T> {
    /// Empty holder using `builder` for new values.
    pub fn new<F>(builder: F) -> Self
    where
        F: Fn(&str) -> io::Result<T> + Send + Sync + 'static,
    {
        Self {
            value: Mutex::new(None),
            builder: Box::new(builder),
        }
    }

    /// Drop the current value, then build one from `name`.
    ///
    /// A blank name leaves the holder empty. When the builder fails the
    /// holder is empty and the error is returned.
    pub fn replace_with_new(&self, name: &str) -> io::Result<()> {
        let mut slot = self.value.lock();
        drop(slot.take());
        if name.trim().is_empty() {
            return Ok(());
        }
        *slot = Some((self.builder)(name)?);
        Ok(())
    }

    /// Run `f` on the current value, if any.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.value.lock().as_mut().map(f)
    }

    /// Run `f` on the slot itself, so it may also clear or replace it.
    pub fn with_slot<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        f(&mut self.value.lock())
    }

    /// Drop the current value.
    pub fn clear(&self) {
        let mut slot = self.value.lock();
        drop(slot.take());
    }

    /// Whether a value is held.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl<T> std::fmt::Debug for SyncSwapValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSwapValue")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked {
        name: String,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn holder(drops: &Arc<AtomicUsize>) -> SyncSwapValue<Tracked> {
        let drops = Arc::clone(drops);
        SyncSwapValue::new(move |name| {
            if name == "bad" {
                return Err(io::Error::new(io::ErrorKind::NotFound, "bad"));
            }
            Ok(Tracked {
                name: name.to_string(),
                drops: Arc::clone(&drops),
            })
        })
    }

    #[test]
    fn test_replace_drops_previous_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = holder(&drops);
        value.replace_with_new("a").unwrap();
        value.replace_with_new("b").unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(value.with(|t| t.name.clone()), Some("b".to_string()));
    }

    #[test]
    fn test_blank_name_clears() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = holder(&drops);
        value.replace_with_new("a").unwrap();
        value.replace_with_new("  ").unwrap();
        assert!(!value.is_set());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_build_leaves_empty() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = holder(&drops);
        value.replace_with_new("a").unwrap();
        assert!(value.replace_with_new("bad").is_err());
        assert!(!value.is_set());
        value.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
