use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

struct FenceState {
    id: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Completion handle for a value produced by an asynchronous device.
///
/// Clones share one state: a value bound to a donor's buffer also waits on the donor's
/// fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceState>,
}

impl Fence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceState {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Mark the producing work as complete and wake waiters
    pub fn signal(&self) -> Result<()> {
        let mut signaled = self
            .inner
            .signaled
            .lock()
            .map_err(|_| Error::Fail("fence lock poisoned".to_string()))?;
        *signaled = true;
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Re-arm the fence before the producer runs again
    pub fn reset(&self) -> Result<()> {
        let mut signaled = self
            .inner
            .signaled
            .lock()
            .map_err(|_| Error::Fail("fence lock poisoned".to_string()))?;
        *signaled = false;
        Ok(())
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.lock().map(|s| *s).unwrap_or(false)
    }

    /// Block until the fence is signaled
    pub fn wait(&self) -> Result<()> {
        let mut signaled = self
            .inner
            .signaled
            .lock()
            .map_err(|_| Error::Fail("fence lock poisoned".to_string()))?;
        while !*signaled {
            signaled = self
                .inner
                .cond
                .wait(signaled)
                .map_err(|_| Error::Fail("fence lock poisoned".to_string()))?;
        }
        Ok(())
    }

    /// True when both handles refer to the same fence
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.inner.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
