//! Scheduled reboots.
//!
//! The RebootManager handles:
//! - Planning the automatic reboot from the `[reboot]` config section
//! - Counting down through the warning schedule, broadcasting each warning
//! - Holding the reboot while any reboot lock is outstanding
//! - Queueing the server shutdown once the countdown completes
//!
//! Every step after the first runs on the object manager loop through a
//! single [`Interval`].

use crate::config::RebootConfig;
use crate::error::RebootError;
use crate::state::managers::lifecycle::{ShutdownManager, Shutdowner};
use crate::state::omgr::{Interval, OmgrHandle};
use chrono::{DateTime, Datelike, Days, TimeZone, Timelike, Utc, Weekday};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Initiator recorded for reboots planned from the configuration.
pub const AUTOMATIC_INITIATOR: &str = "automatic";

pub const REBOOT_WARNING: &str = "m.reboot_warning";
pub const REBOOT_MSG_STANDARD: &str = "m.reboot_msg_standard";
pub const REBOOT_DELAYED: &str = "m.reboot_delayed";
pub const REBOOTING_NOW: &str = "m.rebooting_now";

/// Sends a system message to every connected client.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: &str);
}

/// Told at each warning of a planned reboot.
pub trait PendingShutdownObserver: Send + Sync {
    fn shutdown_planned(&self, warnings_left: usize, time_left: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The warning at `warnings[n]` minutes.
    Warn(usize),
    /// Warnings are over; reboot unless locked.
    Reboot,
    /// The final broadcast went out.
    Shutdown,
}

#[derive(Default)]
struct RebootState {
    deadline: Option<Instant>,
    initiator: Option<String>,
    soon: bool,
    next: Option<Step>,
    locks: BTreeMap<u32, String>,
    next_lock: u32,
}

/// Countdown to a planned server reboot.
pub struct RebootManager {
    config: RebootConfig,
    minute: Duration,
    shutdown: Arc<ShutdownManager>,
    broadcaster: Arc<dyn Broadcaster>,
    timer: Interval,
    state: Mutex<RebootState>,
    observers: RwLock<Vec<Arc<dyn PendingShutdownObserver>>>,
}

impl RebootManager {
    pub fn new(
        config: RebootConfig,
        omgr: &OmgrHandle,
        shutdown: Arc<ShutdownManager>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        Self::with_minute(config, Duration::from_secs(60), omgr, shutdown, broadcaster)
    }

    /// Like [`new`](Self::new) with a custom length for one warning
    /// minute.
    pub(crate) fn with_minute(
        config: RebootConfig,
        minute: Duration,
        omgr: &OmgrHandle,
        shutdown: Arc<ShutdownManager>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<RebootManager>| {
            let me = me.clone();
            let timer = omgr.new_interval("reboot.countdown", move |_mgr| {
                if let Some(manager) = me.upgrade() {
                    manager.fire();
                }
            });
            Self {
                config,
                minute,
                shutdown,
                broadcaster,
                timer,
                state: Mutex::new(RebootState::default()),
                observers: RwLock::new(Vec::new()),
            }
        })
    }

    /// Plans the automatic reboot, if one is configured.
    pub fn init(&self) {
        if self.schedule_regular_reboot() {
            info!(
                days = self.config.day_frequency,
                hour = self.config.hour,
                "Automatic reboot planned"
            );
        }
    }

    /// Plans the next automatic reboot from the configuration. Returns
    /// false when automatic reboots are disabled.
    pub fn schedule_regular_reboot(&self) -> bool {
        if self.config.day_frequency == 0 {
            return false;
        }
        let now = chrono::Local::now();
        let Some(at) = next_regular_reboot(
            now,
            self.config.day_frequency,
            self.config.hour,
            self.config.skip_weekends,
        ) else {
            warn!(hour = self.config.hour, "Could not compute the next automatic reboot");
            return false;
        };
        let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
        self.schedule(delay, true, AUTOMATIC_INITIATOR);
        true
    }

    /// Plans a reboot at `at`, moved later to the next warning boundary so
    /// clients get a full warning. Times in the past mean now.
    pub fn schedule_reboot(&self, at: DateTime<Utc>, initiator: &str) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(delay, false, initiator);
    }

    /// Plans a reboot `delay` from now, rounded like
    /// [`schedule_reboot`](Self::schedule_reboot).
    pub fn schedule_reboot_in(&self, delay: Duration, initiator: &str) {
        self.schedule(delay, false, initiator);
    }

    /// Drops the planned reboot, if any.
    pub fn cancel_reboot(&self) {
        self.timer.cancel();
        let mut state = self.state.lock();
        if state.deadline.take().is_some() {
            info!(initiator = ?state.initiator, "Reboot cancelled");
        }
        state.initiator = None;
        state.soon = false;
        state.next = None;
    }

    /// Whether the warnings have started.
    pub fn will_shutdown_soon(&self) -> bool {
        self.state.lock().soon
    }

    pub fn time_until_reboot(&self) -> Option<Duration> {
        self.state
            .lock()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn initiator(&self) -> Option<String> {
        self.state.lock().initiator.clone()
    }

    pub fn warnings(&self) -> &[u64] {
        &self.config.warnings
    }

    pub fn add_observer(&self, observer: Arc<dyn PendingShutdownObserver>) {
        self.observers.write().push(observer);
    }

    /// Holds any reboot until the returned lock is released with
    /// [`allow_reboot`](Self::allow_reboot).
    pub fn prevent_reboot(&self, where_from: impl Into<String>) -> u32 {
        let mut state = self.state.lock();
        let id = state.next_lock;
        state.next_lock = state.next_lock.wrapping_add(1);
        let where_from = where_from.into();
        debug!(id, holder = %where_from, "Reboot lock taken");
        state.locks.insert(id, where_from);
        id
    }

    pub fn allow_reboot(&self, id: u32) -> Result<(), RebootError> {
        match self.state.lock().locks.remove(&id) {
            Some(holder) => {
                debug!(id, holder = %holder, "Reboot lock released");
                Ok(())
            }
            None => Err(RebootError::NoSuchLock(id)),
        }
    }

    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    // ========================================================================
    // Countdown
    // ========================================================================

    fn schedule(&self, mut delay: Duration, exact: bool, initiator: &str) {
        self.cancel_reboot();

        let mut level = None;
        for (index, &minutes) in self.config.warnings.iter().enumerate().rev() {
            let warn_at = self.minutes(minutes);
            if delay <= warn_at {
                level = Some(index);
                if !exact {
                    delay = warn_at;
                }
                break;
            }
        }
        {
            let mut state = self.state.lock();
            state.deadline = Some(Instant::now() + delay);
            state.initiator = Some(initiator.to_string());
        }
        info!(initiator, in_secs = delay.as_secs(), "Reboot scheduled");
        let minutes = delay.as_millis() / self.minute.as_millis().max(1);
        self.do_warning(level, u64::try_from(minutes).unwrap_or(u64::MAX));
    }

    /// Runs whatever step the timer was armed for.
    fn fire(&self) {
        let step = self.state.lock().next.take();
        match step {
            Some(Step::Warn(level)) => {
                let minutes = self.config.warnings.get(level).copied().unwrap_or(0);
                self.do_warning(Some(level), minutes);
            }
            Some(Step::Reboot) => self.reboot(),
            Some(Step::Shutdown) => self.shutdown.queue_shutdown(),
            None => {}
        }
    }

    /// Gives the warning at `level` (none before the first) and arms the
    /// timer for the next one.
    fn do_warning(&self, level: Option<usize>, minutes: u64) {
        let deadline = {
            let mut state = self.state.lock();
            state.soon = level.is_some();
            state.deadline
        };
        let Some(deadline) = deadline else {
            return;
        };

        if let Some(level) = level {
            self.notify_observers(level, deadline);
            self.broadcaster.broadcast(&self.warning_message(minutes));
        }

        let next = level.map_or(0, |level| level + 1);
        let (step, lead) = match self.config.warnings.get(next) {
            Some(&minutes) => (Step::Warn(next), self.minutes(minutes)),
            None => (Step::Reboot, Duration::ZERO),
        };
        let wait = deadline
            .checked_sub(lead)
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()));
        self.arm(step, wait);
    }

    fn reboot(&self) {
        {
            let state = self.state.lock();
            if !state.locks.is_empty() {
                info!(locks = ?state.locks.values().collect::<Vec<_>>(), "Reboot delayed by outstanding locks");
                drop(state);
                self.broadcaster.broadcast(REBOOT_DELAYED);
                self.arm(Step::Reboot, self.minute);
                return;
            }
            info!(initiator = ?state.initiator, "Performing scheduled reboot");
        }
        self.broadcaster.broadcast(REBOOTING_NOW);
        // A moment for the last broadcast to reach clients.
        self.arm(Step::Shutdown, self.minute / 60);
    }

    fn arm(&self, step: Step, wait: Duration) {
        self.state.lock().next = Some(step);
        self.timer.schedule(wait);
    }

    fn notify_observers(&self, level: usize, deadline: Instant) {
        let warnings_left = self.config.warnings.len().saturating_sub(level + 1);
        let time_left = deadline.saturating_duration_since(Instant::now());
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer.shutdown_planned(warnings_left, time_left);
        }
    }

    fn warning_message(&self, minutes: u64) -> String {
        let text = self
            .config
            .message
            .as_deref()
            .filter(|message| !message.trim().is_empty())
            .unwrap_or(REBOOT_MSG_STANDARD);
        format!("{REBOOT_WARNING}\t{minutes}\t{text}")
    }

    fn minutes(&self, count: u64) -> Duration {
        self.minute
            .saturating_mul(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

impl Shutdowner for RebootManager {
    fn shutdown(&self) {
        self.cancel_reboot();
    }
}

/// The automatic reboot after `now`: `hour` o'clock, `frequency` days out
/// (one day fewer while today's hour is still ahead), moved to Monday when
/// it lands on a weekend and `skip_weekends` is set.
pub fn next_regular_reboot<Tz: TimeZone>(
    now: DateTime<Tz>,
    frequency: u32,
    hour: u32,
    skip_weekends: bool,
) -> Option<DateTime<Tz>> {
    if frequency == 0 {
        return None;
    }
    let days = if now.hour() < hour { frequency - 1 } else { frequency };
    let mut date = now.date_naive().checked_add_days(Days::new(u64::from(days)))?;
    if skip_weekends {
        date = match date.weekday() {
            Weekday::Sat => date.checked_add_days(Days::new(2))?,
            Weekday::Sun => date.checked_add_days(Days::new(1))?,
            _ => date,
        };
    }
    let local = date.and_hms_opt(hour, 0, 0)?;
    now.timezone().from_local_datetime(&local).earliest()
}
