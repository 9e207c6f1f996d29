use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Last user activity, for the idle auto-lock.
#[derive(Debug)]
pub struct IdleTracker {
    last_activity: Mutex<DateTime<Utc>>,
}

impl IdleTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: Mutex::new(now),
        }
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// A zero timeout never expires.
    pub fn expired(&self, now: DateTime<Utc>, timeout_minutes: u32) -> bool {
        timeout_minutes > 0
            && now.signed_duration_since(self.last_activity())
                >= Duration::minutes(i64::from(timeout_minutes))
    }
}
