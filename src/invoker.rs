//! Worker pool for blocking work.
//!
//! Units are started in FIFO order on a bounded set of blocking threads.
//! A unit whose `invoke` returns true gets its `handle_result` run back on
//! the object manager loop, where it may touch objects.

use crate::config::InvokerConfig;
use crate::state::managers::lifecycle::Shutdowner;
use crate::state::omgr::{DObjectManager, OmgrHandle};
use crate::telemetry::{UnitTimer, spans};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A piece of blocking work.
pub trait InvokerUnit: Send + 'static {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("unit")
    }

    /// Runs on a worker thread. Return true to have `handle_result`
    /// called on the object manager loop.
    fn invoke(&mut self) -> bool;

    fn handle_result(self: Box<Self>, _mgr: &mut DObjectManager) {}
}

type BoxedUnit = Box<dyn InvokerUnit>;

struct Inner {
    tx: Mutex<Option<mpsc::UnboundedSender<BoxedUnit>>>,
    finished: watch::Receiver<bool>,
}

/// Handle to the worker pool.
#[derive(Clone)]
pub struct Invoker {
    inner: Arc<Inner>,
}

impl Invoker {
    /// Starts the dispatcher. Results are posted back through `omgr`.
    pub fn spawn(omgr: OmgrHandle, config: &InvokerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, finished) = watch::channel(false);
        let workers = config.workers.max(1);
        tokio::spawn(dispatch(
            rx,
            omgr,
            Arc::new(Semaphore::new(workers)),
            config.long_unit_threshold(),
            done_tx,
        ));
        info!(workers, "Invoker started");
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                finished,
            }),
        }
    }

    /// Queues a unit. Units posted after shutdown are dropped.
    pub fn post_unit(&self, unit: BoxedUnit) {
        let guard = self.inner.tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!(unit = %unit.name(), "Unit posted to a stopped invoker");
            return;
        };
        if let Err(e) = tx.send(unit) {
            warn!(unit = %e.0.name(), "Invoker queue closed");
        }
    }

    /// Runs `work` on a worker, then `done` with its result on the loop.
    pub fn post<T, W, D>(&self, name: impl Into<Cow<'static, str>>, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(T, &mut DObjectManager) + Send + 'static,
    {
        self.post_unit(Box::new(FnUnit {
            name: name.into(),
            work: Some(work),
            result: None,
            done,
        }));
    }

    /// Stops accepting units. Units already queued still run.
    pub fn shutdown(&self) {
        if self.inner.tx.lock().take().is_some() {
            info!("Invoker shutting down");
        }
    }

    /// Resolves once shutdown was requested and every queued unit ran.
    pub async fn drained(&self) {
        let mut finished = self.inner.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl Shutdowner for Invoker {
    fn shutdown(&self) {
        Invoker::shutdown(self);
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<BoxedUnit>,
    omgr: OmgrHandle,
    slots: Arc<Semaphore>,
    threshold: Duration,
    done_tx: watch::Sender<bool>,
) {
    let mut workers = JoinSet::new();
    while let Some(unit) = rx.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let omgr = omgr.clone();
        workers.spawn_blocking(move || {
            let _permit = permit;
            run_unit(unit, &omgr, threshold);
        });
        while workers.try_join_next().is_some() {}
    }
    while workers.join_next().await.is_some() {}
    debug!("Invoker drained");
    let _ = done_tx.send(true);
}

fn run_unit(mut unit: BoxedUnit, omgr: &OmgrHandle, threshold: Duration) {
    let name = unit.name();
    let _span = spans::unit("invoker", &name).entered();
    let outcome = {
        let _timer = UnitTimer::new("invoker", &name, threshold);
        std::panic::catch_unwind(AssertUnwindSafe(|| unit.invoke()))
    };
    match outcome {
        Ok(true) => omgr.post_runnable(name, move |mgr| unit.handle_result(mgr)),
        Ok(false) => {}
        Err(_) => error!(unit = %name, "Invoker unit choked"),
    }
}

struct FnUnit<T, W, D> {
    name: Cow<'static, str>,
    work: Option<W>,
    result: Option<T>,
    done: D,
}

impl<T, W, D> InvokerUnit for FnUnit<T, W, D>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(T, &mut DObjectManager) + Send + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn invoke(&mut self) -> bool {
        match self.work.take() {
            Some(work) => {
                self.result = Some(work());
                true
            }
            None => false,
        }
    }

    fn handle_result(self: Box<Self>, mgr: &mut DObjectManager) {
        let this = *self;
        if let Some(result) = this.result {
            (this.done)(result, mgr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OmgrConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    impl InvokerUnit for Counting {
        fn invoke(&mut self) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    struct Exploding;

    impl InvokerUnit for Exploding {
        fn invoke(&mut self) -> bool {
            panic!("worker exploded");
        }
    }

    #[tokio::test]
    async fn result_runs_on_the_loop() {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let invoker = Invoker::spawn(omgr.clone(), &InvokerConfig::default());
        let (tx, rx) = oneshot::channel();
        invoker.post(
            "square",
            || 7 * 7,
            move |value, mgr| {
                let _ = tx.send((value, mgr.object_count()));
            },
        );
        let (value, objects) = rx.await.unwrap();
        assert_eq!(value, 49);
        assert_eq!(objects, 1);
        omgr.shutdown();
    }

    #[tokio::test]
    async fn panicking_unit_does_not_kill_the_pool() {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let invoker = Invoker::spawn(omgr.clone(), &InvokerConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        invoker.post_unit(Box::new(Exploding));
        invoker.post_unit(Box::new(Counting { hits: hits.clone() }));
        invoker.shutdown();
        invoker.drained().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        omgr.shutdown();
    }

    #[tokio::test]
    async fn units_after_shutdown_are_dropped() {
        let (omgr, _join) = DObjectManager::spawn(&OmgrConfig::default());
        let invoker = Invoker::spawn(omgr.clone(), &InvokerConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        invoker.shutdown();
        invoker.post_unit(Box::new(Counting { hits: hits.clone() }));
        invoker.drained().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        omgr.shutdown();
    }
}
