//! Timers that fire on the object manager loop.
//!
//! The countdown runs on a tokio task; on expiry the action is posted as a
//! runnable, so it sees object state in queue order like any other unit.

use super::{DObjectManager, OmgrHandle};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Action = Box<dyn FnMut(&mut DObjectManager) + Send>;

struct Inner {
    name: Cow<'static, str>,
    omgr: OmgrHandle,
    action: Arc<Mutex<Action>>,
    armed: Mutex<Option<CancellationToken>>,
}

/// A reschedulable timer created by [`OmgrHandle::new_interval`].
///
/// Scheduling replaces any earlier schedule. Expiries that were already
/// posted to the loop are skipped once the interval is cancelled.
#[derive(Clone)]
pub struct Interval {
    inner: Arc<Inner>,
}

impl Interval {
    pub(super) fn new(omgr: OmgrHandle, name: Cow<'static, str>, action: Action) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                omgr,
                action: Arc::new(Mutex::new(action)),
                armed: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runs the action once, `delay` from now.
    pub fn schedule(&self, delay: Duration) {
        self.arm(delay, None);
    }

    /// Runs the action `delay` from now and then every `period` until
    /// cancelled or the loop stops.
    pub fn schedule_repeating(&self, delay: Duration, period: Duration) {
        self.arm(delay, Some(period));
    }

    pub fn cancel(&self) {
        if let Some(token) = self.inner.armed.lock().take() {
            token.cancel();
            debug!(interval = %self.inner.name, "Interval cancelled");
        }
    }

    fn arm(&self, delay: Duration, period: Option<Duration>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(interval = %self.inner.name, "Interval scheduled outside a tokio runtime");
            return;
        };
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.armed.lock().replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                if !inner.omgr.is_running() {
                    return;
                }
                let action = Arc::clone(&inner.action);
                let fired = token.clone();
                inner.omgr.post_runnable(inner.name.clone(), move |mgr| {
                    if !fired.is_cancelled() {
                        (action.lock())(mgr);
                    }
                });
                match period {
                    Some(period) => wait = period,
                    None => return,
                }
            }
        });
    }
}

impl std::fmt::Debug for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interval")
            .field("name", &self.inner.name)
            .finish()
    }
}
