//! Gain automation.
//!
//! A [`GainParam`] holds a value in `[0, 1]` and at most one pending linear ramp. Every ramp
//! request first cancels whatever is pending and snapshots the value at the moment of the
//! request, so interrupting a fade never produces a jump.
//!
//! Times are absolute seconds on the session clock. The parameter itself has no clock;
//! callers pass `now` explicitly, which keeps it trivially testable.

use murmur_core::Volume;

/// A linear ramp between two points on the session clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub start_time: f64,
    pub start_value: f32,
    pub end_time: f64,
    pub end_value: f32,
}

impl Ramp {
    fn value_at(&self, time: f64) -> f32 {
        if time >= self.end_time {
            return self.end_value;
        }
        if time <= self.start_time {
            return self.start_value;
        }
        let progress = (time - self.start_time) / (self.end_time - self.start_time);
        let delta = f64::from(self.end_value - self.start_value);
        (f64::from(self.start_value) + delta * progress) as f32
    }
}

/// Automatable gain of one playback unit or the master bus.
#[derive(Debug, Clone, PartialEq)]
pub struct GainParam {
    /// Held value, or the ramp's start value while one is pending.
    value: f32,
    ramp: Option<Ramp>,
    /// Bumped on every mutation.
    revision: u64,
}

impl GainParam {
    pub fn new(value: f32) -> Self {
        Self {
            value: Volume::new(value).as_f32(),
            ramp: None,
            revision: 0,
        }
    }

    /// Value at `time`, following the pending ramp if there is one.
    pub fn value_at(&self, time: f64) -> f32 {
        self.ramp.map_or(self.value, |ramp| ramp.value_at(time))
    }

    /// The value this parameter is heading to once automation finishes.
    pub fn target(&self) -> f32 {
        self.ramp.map_or(self.value, |ramp| ramp.end_value)
    }

    pub const fn ramp(&self) -> Option<Ramp> {
        self.ramp
    }

    pub fn is_ramping(&self, time: f64) -> bool {
        self.ramp.is_some_and(|ramp| time < ramp.end_time)
    }

    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Jump to `value` now, dropping any pending ramp.
    pub fn set_immediate(&mut self, value: f32) {
        self.ramp = None;
        self.value = Volume::new(value).as_f32();
        self.revision += 1;
    }

    /// Freeze at the value reached at `now`, dropping any pending ramp.
    pub fn cancel_pending(&mut self, now: f64) {
        self.value = self.value_at(now);
        self.ramp = None;
        self.revision += 1;
    }

    /// Cancel, snapshot the current value, then ramp linearly to `value` over `duration`.
    ///
    /// A zero, negative or non-finite duration sets the value immediately.
    pub fn ramp_to(&mut self, value: f32, duration: f64, now: f64) {
        self.cancel_pending(now);
        let target = Volume::new(value).as_f32();

        if !duration.is_finite() || duration <= 0.0 {
            self.value = target;
            return;
        }

        self.ramp = Some(Ramp {
            start_time: now,
            start_value: self.value,
            end_time: now + duration,
            end_value: target,
        });
    }

    /// Ramp from an explicit starting value rather than the current one.
    pub fn ramp_from(&mut self, from: f32, to: f32, duration: f64, now: f64) {
        self.set_immediate(from);
        self.ramp_to(to, duration, now);
    }

    /// Collapse a finished ramp into the held value. Does not count as a mutation.
    pub fn settle(&mut self, now: f64) {
        if let Some(ramp) = self.ramp {
            if now >= ramp.end_time {
                self.value = ramp.end_value;
                self.ramp = None;
            }
        }
    }
}

impl Default for GainParam {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_linear_ramp() {
        let mut gain = GainParam::new(0.0);
        gain.ramp_to(1.0, 2.0, 10.0);

        assert!(approx(gain.value_at(10.0), 0.0));
        assert!(approx(gain.value_at(11.0), 0.5));
        assert!(approx(gain.value_at(12.0), 1.0));
        assert!(approx(gain.value_at(50.0), 1.0));
        assert!(approx(gain.target(), 1.0));
        assert!(gain.is_ramping(11.9));
        assert!(!gain.is_ramping(12.0));
    }

    #[test]
    fn test_second_ramp_starts_from_cancellation_value() {
        let mut gain = GainParam::new(0.0);
        gain.ramp_to(1.0, 1.0, 0.0);
        // Interrupt a quarter of the way in.
        gain.ramp_to(0.0, 1.0, 0.25);

        let ramp = gain.ramp().unwrap_or_else(|| unreachable!());
        assert!(approx(ramp.start_value, 0.25));
        assert!((ramp.start_time - 0.25).abs() < f64::EPSILON);
        assert!(approx(ramp.end_value, 0.0));
        // No trace of the first ramp: halfway through the second one.
        assert!(approx(gain.value_at(0.75), 0.125));
        assert!(approx(gain.value_at(1.25), 0.0));
    }

    #[test]
    fn test_cancel_pending_holds_current_value() {
        let mut gain = GainParam::new(1.0);
        gain.ramp_to(0.0, 4.0, 0.0);
        gain.cancel_pending(1.0);
        assert!(gain.ramp().is_none());
        assert!(approx(gain.value_at(100.0), 0.75));
    }

    #[test]
    fn test_zero_duration_is_immediate() {
        let mut gain = GainParam::new(0.2);
        gain.ramp_to(0.9, 0.0, 3.0);
        assert!(gain.ramp().is_none());
        assert!(approx(gain.value_at(3.0), 0.9));

        gain.ramp_to(0.1, f64::NAN, 3.0);
        assert!(approx(gain.value_at(3.0), 0.1));
    }

    #[test]
    fn test_ramp_from_ignores_stale_value() {
        let mut gain = GainParam::new(0.8);
        gain.ramp_from(0.0, 0.6, 2.0, 5.0);
        assert!(approx(gain.value_at(5.0), 0.0));
        assert!(approx(gain.value_at(6.0), 0.3));
    }

    #[test]
    fn test_values_are_clamped() {
        let mut gain = GainParam::new(3.0);
        assert!(approx(gain.target(), 1.0));
        gain.set_immediate(-1.0);
        assert!(approx(gain.target(), 0.0));
        gain.ramp_to(f32::NAN, 1.0, 0.0);
        assert!(approx(gain.target(), 0.0));
    }

    #[test]
    fn test_settle_and_revision() {
        let mut gain = GainParam::new(0.0);
        let rev = gain.revision();
        gain.ramp_to(1.0, 1.0, 0.0);
        assert!(gain.revision() > rev);

        let rev = gain.revision();
        gain.settle(0.5);
        assert!(gain.ramp().is_some());
        gain.settle(1.0);
        assert!(gain.ramp().is_none());
        assert!(approx(gain.value_at(1.0), 1.0));
        assert_eq!(gain.revision(), rev);
    }

    proptest! {
        #[test]
        fn ramp_values_stay_between_endpoints(
            from in 0.0f32..=1.0,
            to in 0.0f32..=1.0,
            duration in 0.01f64..10.0,
            t in -1.0f64..20.0,
        ) {
            let mut gain = GainParam::new(from);
            gain.ramp_to(to, duration, 0.0);
            let v = gain.value_at(t);
            prop_assert!(v >= from.min(to) - 1e-6 && v <= from.max(to) + 1e-6);
        }
    }
}
