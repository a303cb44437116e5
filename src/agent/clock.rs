//! Guest clock reconciliation.
//!
//! ```text
//! loop {
//!     drain stale bytes
//!     guest-get-time, then read host clock  →  drift = host − guest
//!     |drift| > max_drift  →  guest-set-time(host)
//!     sleep(interval) or stop
//! }
//! ```
//!
//! The first error ends the task; it is returned from [`ClockSyncHandle::join`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::client::AgentConnection;
use crate::error::{Result, VmError};

pub const MAX_DRIFT: Duration = Duration::from_secs(120);
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSettings {
    /// Drift tolerated before the guest clock is reset.
    pub max_drift: Duration,
    /// Pause between two reconciliations.
    pub interval: Duration,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            max_drift: MAX_DRIFT,
            interval: SYNC_INTERVAL,
        }
    }
}

/// Compare the guest clock with the host clock and correct it when the drift
/// is beyond `max_drift`. Returns the time that was set, if any.
///
/// `host_clock` is read once, after the guest's reply has arrived, so the
/// round trip does not leave the guest behind.
pub async fn reconcile<C>(
    conn: &mut AgentConnection,
    max_drift: Duration,
    host_clock: C,
) -> Result<Option<DateTime<Utc>>>
where
    C: Fn() -> DateTime<Utc>,
{
    let guest_now = conn.guest_get_time().await?;
    let host_now = host_clock();
    let drift_ms = (host_now - guest_now).num_milliseconds();
    let limit_ms = i64::try_from(max_drift.as_millis()).unwrap_or(i64::MAX);

    if drift_ms.unsigned_abs() > limit_ms.unsigned_abs() {
        info!(%guest_now, %host_now, drift_ms, "guest clock drifted, resetting");
        conn.guest_set_time(host_now).await?;
        Ok(Some(host_now))
    } else {
        debug!(drift_ms, "guest clock within tolerance");
        Ok(None)
    }
}

/// Background clock reconciliation over one agent connection.
pub struct ClockSync;

impl ClockSync {
    /// Start the loop on the current tokio runtime.
    pub fn spawn(conn: AgentConnection, settings: ClockSettings) -> ClockSyncHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(conn, settings, stop_rx));
        ClockSyncHandle {
            stop: stop_tx,
            task,
        }
    }
}

async fn run(
    mut conn: AgentConnection,
    settings: ClockSettings,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    info!(socket = %conn.path().display(), "clock sync started");
    loop {
        if *stop.borrow() {
            break;
        }

        let result = match conn.drain().await {
            Ok(_) => reconcile(&mut conn, settings.max_drift, Utc::now).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(error = %e, "clock sync terminated");
            return Err(e);
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            changed = stop.changed() => {
                // A dropped handle counts as a stop request.
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("clock sync stopped");
    Ok(())
}

/// Owner of a running [`ClockSync`] task.
///
/// Dropping the handle stops the loop at its next wake-up.
pub struct ClockSyncHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ClockSyncHandle {
    /// Signal the loop to stop and wait for it.
    pub async fn stop(self) -> Result<()> {
        let ClockSyncHandle { stop, mut task } = self;
        let _ = stop.send(true);
        join_task(&mut task).await
    }

    /// Wait for the loop to end on its own, which only happens on error.
    pub async fn join(self) -> Result<()> {
        let ClockSyncHandle { stop, mut task } = self;
        let result = join_task(&mut task).await;
        drop(stop);
        result
    }

    /// Wait for the loop to end on its own without giving up the handle.
    ///
    /// Must not be polled again once it has completed.
    pub async fn finished(&mut self) -> Result<()> {
        join_task(&mut self.task).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn join_task(task: &mut JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|e| VmError::Io(std::io::Error::other(e)))?
}
