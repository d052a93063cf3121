//! Day-step partitioning of the queried time range.
//!
//! Instead of one query over `[time.min, time.max]`, the processor
//! issues one sub-query per window of `day_step` days, newest first.
//! The first window (present only when `time.until` is absent) is
//! closed at the top (`<=` on the upper bound); all later windows use
//! a half-open `[lower, upper)` range.

use chrono::{DateTime, Duration, Utc};

/// One query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub lower: DateTime<Utc>,
    pub upper: DateTime<Utc>,
    /// `time <= upper` when set; `time < upper` otherwise.
    pub upper_inclusive: bool,
}

/// Iterator over the windows, newest to oldest.
pub struct DayStepWindows {
    time_min: DateTime<Utc>,
    step: Duration,
    /// Upper bound the next emitted window walks down from; `None`
    /// before the leading inclusive window has been emitted.
    continue_from: Option<DateTime<Utc>>,
    leading_window: Option<TimeWindow>,
    /// The `time.until` form always yields at least one window.
    must_emit: bool,
}

impl DayStepWindows {
    /// `now` feeds the `time.max`-absent default of `now + 1h`.
    pub fn new(
        time_min: DateTime<Utc>,
        time_max: Option<DateTime<Utc>>,
        time_until: Option<DateTime<Utc>>,
        day_step: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let step = Duration::days(day_step.max(1) as i64);
        match time_until {
            None => {
                let upper = time_max.unwrap_or(now + Duration::hours(1));
                let lower = (upper - step).max(time_min);
                Self {
                    time_min,
                    step,
                    continue_from: Some(lower),
                    leading_window: Some(TimeWindow {
                        lower,
                        upper,
                        upper_inclusive: true,
                    }),
                    must_emit: false,
                }
            }
            Some(until) => Self {
                time_min,
                step,
                continue_from: Some(until),
                leading_window: None,
                must_emit: true,
            },
        }
    }
}

impl Iterator for DayStepWindows {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if let Some(leading) = self.leading_window.take() {
            return Some(leading);
        }
        let from = self.continue_from?;
        if from <= self.time_min && !self.must_emit {
            self.continue_from = None;
            return None;
        }
        self.must_emit = false;
        let upper = from;
        let lower = (upper - self.step).max(self.time_min);
        self.continue_from = Some(lower);
        Some(TimeWindow {
            lower,
            upper,
            upper_inclusive: false,
        })
    }
}
