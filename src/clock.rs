//! Wall-clock access. Operations read the clock once and compare against
//! that value.

pub use mockable::{Clock, DefaultClock};

use crate::model::Ms;

/// Millisecond view of a [`Clock`].
pub trait ClockExt {
    fn now_ms(&self) -> Ms;
}

impl<C: Clock + ?Sized> ClockExt for C {
    fn now_ms(&self) -> Ms {
        self.utc().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub(crate) struct ManualClock(std::sync::Mutex<chrono::DateTime<chrono::Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self(std::sync::Mutex::new(Self::instant(now)))
    }

    pub fn set(&self, now: Ms) {
        *self.lock_clock() = Self::instant(now);
    }

    pub fn advance(&self, by: Ms) {
        *self.lock_clock() += chrono::TimeDelta::milliseconds(by);
    }

    fn instant(ms: Ms) -> chrono::DateTime<chrono::Utc> {
        match chrono::DateTime::from_timestamp_millis(ms) {
            Some(t) => t,
            None => panic!("timestamp out of range: {ms}"),
        }
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, chrono::DateTime<chrono::Utc>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("clock mutex"),
        }
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn local(&self) -> chrono::DateTime<chrono::Local> {
        self.utc().with_timezone(&chrono::Local)
    }

    fn utc(&self) -> chrono::DateTime<chrono::Utc> {
        *self.lock_clock()
    }
}
