use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use super::{SessionValidator, ValidatorError};

/// In-process validator used by unit/integration tests.
#[derive(Clone, Default)]
pub struct MockValidator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    valid: RwLock<HashSet<String>>,
    unreachable: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
    delay: RwLock<Option<Duration>>,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

impl MockValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validator that accepts exactly the given sessions.
    pub fn with_sessions<I, S>(sessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for session in sessions {
            mock.allow(session);
        }
        mock
    }

    pub fn allow(&self, session: impl Into<String>) {
        self.inner
            .valid
            .write()
            .expect("lock poisoned")
            .insert(session.into());
    }

    pub fn revoke(&self, session: &str) {
        self.inner
            .valid
            .write()
            .expect("lock poisoned")
            .remove(session);
    }

    /// Make every `validate` fail as if the daemon were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make `close` fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Hold every `validate` for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.inner.delay.write().expect("lock poisoned") = delay;
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionValidator for MockValidator {
    async fn validate(&self, session_id: &str) -> Result<bool, ValidatorError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.delay.read().expect("lock poisoned");
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ValidatorError::Closed);
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(ValidatorError::Connect {
                addr: "mock".to_string(),
                reason: "daemon unreachable".to_string(),
            });
        }

        Ok(self
            .inner
            .valid
            .read()
            .expect("lock poisoned")
            .contains(session_id))
    }

    async fn close(&self) -> Result<(), ValidatorError> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_close.load(Ordering::SeqCst) {
            return Err(ValidatorError::Daemon("close rejected".to_string()));
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ValidatorError::Closed);
        }
        Ok(())
    }
}
