//! When automatic backups should run.
//!
//! Everything here is a pure function of settings and a supplied clock, so
//! the timer loop at the bottom is the only part that needs a runtime.

use crate::backup::{BackupManager, BackupSettings};
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Local-time hours during which regular scheduled backups may fire.
/// `start_hour` is inclusive and `end_hour` exclusive; a window that wraps
/// past midnight (e.g. 22..3) is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for BackupWindow {
    fn default() -> Self {
        Self {
            start_hour: 2,
            end_hour: 5,
        }
    }
}

impl BackupWindow {
    pub const ALL_DAY: BackupWindow = BackupWindow {
        start_hour: 0,
        end_hour: 24,
    };

    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// True when backups are enabled and the configured interval has passed
/// since the last one, or there has never been one.
pub fn is_overdue(settings: &BackupSettings, now: DateTime<Utc>) -> bool {
    if !settings.enabled {
        return false;
    }
    match settings.last_backup_at {
        None => true,
        Some(last) => now.signed_duration_since(last) >= settings.frequency.interval(),
    }
}

/// Regular scheduled run: overdue and inside the window, judged in the
/// time zone of `now`.
pub fn is_due<Tz: TimeZone>(settings: &BackupSettings, window: &BackupWindow, now: &DateTime<Tz>) -> bool {
    is_overdue(settings, now.with_timezone(&Utc)) && window.contains(now.hour())
}

/// One-shot run permitted shortly after unlock when a backup is overdue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    pub armed_at: DateTime<Utc>,
    pub delay: Duration,
}

impl CatchUp {
    pub fn new(armed_at: DateTime<Utc>, delay: Duration) -> Self {
        Self { armed_at, delay }
    }

    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.armed_at + self.delay
    }
}

/// Drive `BackupManager::scheduled_tick` from a tokio timer. The first tick
/// lands after `first_tick` (the catch-up delay), then every `period`.
pub fn spawn_scheduler(
    manager: Arc<BackupManager>,
    period: std::time::Duration,
    first_tick: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = period.as_secs(), "backup scheduler started");
        let mut ticker = time::interval_at(Instant::now() + first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let manager = manager.clone();
            match tokio::task::spawn_blocking(move || manager.scheduled_tick(Utc::now())).await {
                Ok(Ok(Some(backup))) => info!(file = %backup.file_name, "scheduled backup written"),
                Ok(Ok(None)) => debug!("no backup due"),
                Ok(Err(err)) => warn!(error = %err, "scheduled backup failed"),
                Err(err) => warn!(error = %err, "scheduled backup task panicked"),
            }
        }
    })
}
