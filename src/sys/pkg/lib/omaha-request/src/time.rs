// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wall-clock access, abstracted so that scattering and ping bookkeeping can be tested against a
//! controllable clock.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

const MICROS_PER_SEC: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 24 * 60 * 60 * MICROS_PER_SEC;

/// Anything that can tell the current wall time.
pub trait TimeSource {
    fn now(&self) -> SystemTime;
}

/// The TimeSource backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardTimeSource;

impl TimeSource for StandardTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A TimeSource that only moves when told to.  Clones share the same clock.
#[derive(Clone, Debug)]
pub struct MockTimeSource {
    time: Rc<Cell<SystemTime>>,
}

impl MockTimeSource {
    pub fn new(time: SystemTime) -> Self {
        MockTimeSource { time: Rc::new(Cell::new(time)) }
    }

    pub fn new_from_now() -> Self {
        Self::new(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        self.time.set(self.time.get() + duration);
    }

    /// Move the clock backwards, as happens when the system clock gets corrected.
    pub fn rewind(&self, duration: Duration) {
        self.time.set(self.time.get() - duration);
    }

    pub fn set(&self, time: SystemTime) {
        self.time.set(time);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> SystemTime {
        self.time.get()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/// Timestamps are persisted as signed microseconds relative to the unix epoch.
pub fn system_time_to_micros(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_micros()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_micros()).map(|m| -m).unwrap_or(i64::MIN),
    }
}

/// None if the platform can't represent the time.
pub fn micros_to_system_time(micros: i64) -> Option<SystemTime> {
    let offset = Duration::from_micros(micros.unsigned_abs());
    if micros >= 0 {
        SystemTime::UNIX_EPOCH.checked_add(offset)
    } else {
        SystemTime::UNIX_EPOCH.checked_sub(offset)
    }
}

/// `later - earlier` in signed microseconds, negative if the clock went backwards.  None if the
/// difference doesn't fit.
pub fn signed_micros_between(earlier: SystemTime, later: SystemTime) -> Option<i64> {
    system_time_to_micros(later).checked_sub(system_time_to_micros(earlier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_time_source_shares_clock() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let time_source = MockTimeSource::new(start);
        let clone = time_source.clone();
        clone.advance(Duration::from_secs(5));
        assert_eq!(time_source.now(), start + Duration::from_secs(5));
        time_source.rewind(Duration::from_secs(10));
        assert_eq!(clone.now(), start - Duration::from_secs(5));
    }

    #[test]
    fn test_micros_conversion() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_micros(1_234_567);
        assert_eq!(system_time_to_micros(time), 1_234_567);
        assert_eq!(micros_to_system_time(1_234_567), Some(time));

        let before_epoch = SystemTime::UNIX_EPOCH - Duration::from_secs(2);
        assert_eq!(system_time_to_micros(before_epoch), -2 * MICROS_PER_SEC);
        assert_eq!(micros_to_system_time(-2 * MICROS_PER_SEC), Some(before_epoch));
    }

    #[test]
    fn test_signed_micros_between() {
        let a = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let b = SystemTime::UNIX_EPOCH + Duration::from_secs(4);
        assert_eq!(signed_micros_between(a, b), Some(-6 * MICROS_PER_SEC));
        assert_eq!(signed_micros_between(b, a), Some(6 * MICROS_PER_SEC));
    }

    #[test]
    fn test_signed_micros_between_out_of_range() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        if let Some(far_past) = micros_to_system_time(i64::MIN + 1) {
            assert_eq!(signed_micros_between(far_past, now), None);
        }
        if let Some(far_future) = micros_to_system_time(i64::MAX) {
            let before_epoch = SystemTime::UNIX_EPOCH - Duration::from_secs(10);
            assert_eq!(signed_micros_between(before_epoch, far_future), None);
        }
    }
}
