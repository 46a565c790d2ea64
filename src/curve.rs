use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{Result, SimError};
use crate::primitives::{FVal, Time};

/// Marker for an unbounded number of loop repetitions.
pub const LOOP_INFINITE: i32 = -1;

fn check_loop(period: Time, times: i32) -> Result<()> {
    if period < 0 {
        return Err(SimError::Config(format!("invalid loop period: {period}")));
    }
    if times < LOOP_INFINITE || times == 0 {
        return Err(SimError::Config(format!("invalid loop times: {times}")));
    }
    Ok(())
}

/// Folds `t` into the loop, or reports expiry of a finite loop.
/// With no loop configured, `t` passes through unchanged.
fn fold_time(t: Time, period: Time, times: i32) -> Option<Time> {
    if period > 0 {
        if times > 0 && t > period * times as Time {
            return None;
        }
        Some(t.rem_euclid(period))
    } else {
        Some(t)
    }
}

/// A piecewise-constant function of simulated time.
///
/// Breakpoints are (time, value) pairs with strictly increasing times.
/// Before the first breakpoint and after a finite loop expires the value is
/// 0.0; an expired curve is thus indistinguishable from a zero one, so
/// callers that need the distinction check [StepCurve::loop_end]. An override
/// short-circuits evaluation to a fixed value.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCurve {
    times: Vec<Time>,
    values: Vec<FVal>,
    loop_period: Time,
    loop_times: i32,
    override_val: Option<FVal>,
}

impl StepCurve {
    pub fn empty() -> Self {
        Self {
            times: Vec::new(),
            values: Vec::new(),
            loop_period: 0,
            loop_times: 1,
            override_val: None,
        }
    }

    /// A curve that is `value` from t = 0 onwards.
    pub fn flat(value: FVal) -> Self {
        Self {
            times: vec![0],
            values: vec![value],
            loop_period: 0,
            loop_times: 1,
            override_val: None,
        }
    }

    pub fn new(times: Vec<Time>, values: Vec<FVal>, loop_period: Time, loop_times: i32) -> Result<Self> {
        let curve = Self {
            times,
            values,
            loop_period,
            loop_times,
            override_val: None,
        };
        curve.check()?;
        Ok(curve)
    }

    fn check(&self) -> Result<()> {
        check_loop(self.loop_period, self.loop_times)?;
        if self.times.len() != self.values.len() {
            return Err(SimError::Config(format!(
                "curve has {} times but {} values",
                self.times.len(),
                self.values.len()
            )));
        }
        if let Some(&last) = self.times.last() {
            if self.loop_period > 0 && last > self.loop_period {
                return Err(SimError::Config(format!(
                    "curve's last time ({last}) exceeds loop period ({})",
                    self.loop_period
                )));
            }
        }
        for &t in &self.times {
            if t < 0 {
                return Err(SimError::Config(format!("curve time ({t}) must be non-negative")));
            }
        }
        for w in self.times.windows(2) {
            if w[0] >= w[1] {
                return Err(SimError::Config(format!(
                    "curve times ({} and {}) must be increasing",
                    w[0], w[1]
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn period(&self) -> Time {
        self.loop_period
    }

    pub fn repeat_times(&self) -> i32 {
        self.loop_times
    }

    /// The time after which a finite loop yields 0.0, if there is one.
    pub fn loop_end(&self) -> Option<Time> {
        (self.loop_period > 0 && self.loop_times > 0)
            .then(|| self.loop_period * self.loop_times as Time)
    }

    pub fn times(&self) -> &[Time] {
        &self.times
    }

    pub fn values(&self) -> &[FVal] {
        &self.values
    }

    /// Appends a breakpoint. The time must exceed the current last one.
    pub fn append(&mut self, time: Time, value: FVal) -> Result<()> {
        if let Some(&last) = self.times.last() {
            if time <= last {
                return Err(SimError::Config(format!(
                    "new time ({time}) must be greater than the last time ({last}) in the curve"
                )));
            }
        } else if time < 0 {
            return Err(SimError::Config(format!("curve time ({time}) must be non-negative")));
        }
        if self.loop_period > 0 && time > self.loop_period {
            return Err(SimError::Config(format!(
                "curve time ({time}) exceeds loop period ({})",
                self.loop_period
            )));
        }
        self.times.push(time);
        self.values.push(value);
        Ok(())
    }

    pub fn set_override(&mut self, value: FVal) {
        self.override_val = Some(value);
    }

    pub fn clear_override(&mut self) {
        self.override_val = None;
    }

    pub fn override_value(&self) -> Option<FVal> {
        self.override_val
    }

    /// Evaluates the curve at `t`, honoring the override if one is set.
    pub fn value_at(&self, t: Time) -> FVal {
        if let Some(v) = self.override_val {
            return v;
        }
        let Some(t) = fold_time(t, self.loop_period, self.loop_times) else {
            return 0.0;
        };
        if self.times.is_empty() || t < self.times[0] {
            return 0.0;
        }
        let i = self.times.partition_point(|&bt| bt <= t);
        self.values[i - 1]
    }

    pub fn scale(mut self, factor: FVal) -> Self {
        for v in &mut self.values {
            *v *= factor;
        }
        self
    }

    pub fn negate(self) -> Self {
        self.scale(-1.0)
    }

    /// Materializes a finite loop into a flat, non-looping curve.
    pub fn expand(&self) -> Result<Self> {
        if self.loop_times == LOOP_INFINITE {
            return Err(SimError::Config("cannot expand an infinite curve".to_string()));
        }
        let mut times = self.times.clone();
        let mut values = self.values.clone();
        for rep in 1..self.loop_times as Time {
            for (&t, &v) in self.times.iter().zip(&self.values) {
                times.push(t + self.loop_period * rep);
                values.push(v);
            }
        }
        StepCurve::new(times, values, 0, 1)
    }
}

/// A sorted set of disjoint, inclusive time intervals with loop semantics.
///
/// A forced override takes priority over evaluation entirely; a window set
/// built with [TimeWindows::always] is nothing but an override.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindows {
    spans: Vec<(Time, Time)>,
    loop_period: Time,
    loop_times: i32,
    forced: Option<bool>,
}

impl TimeWindows {
    /// An empty window set that always answers `value`.
    pub fn always(value: bool) -> Self {
        Self {
            spans: Vec::new(),
            loop_period: 0,
            loop_times: 1,
            forced: Some(value),
        }
    }

    pub fn new(spans: Vec<(Time, Time)>, loop_period: Time, loop_times: i32) -> Result<Self> {
        check_loop(loop_period, loop_times)?;
        if let Some(&(_, last_end)) = spans.last() {
            if loop_period > 0 && last_end > loop_period {
                return Err(SimError::Config(format!(
                    "time window end ({last_end}) exceeds loop period ({loop_period})"
                )));
            }
        }
        for &(start, end) in &spans {
            if start < 0 || end < 0 {
                return Err(SimError::Config(format!(
                    "time window ({start},{end}) must be non-negative"
                )));
            }
            if start > end {
                return Err(SimError::Config(format!(
                    "time window start ({start}) must not exceed its end ({end})"
                )));
            }
        }
        for w in spans.windows(2) {
            if w[0].1 >= w[1].0 {
                return Err(SimError::Config(format!(
                    "time windows ({},{}) and ({},{}) must be non-overlapping and increasing",
                    w[0].0, w[0].1, w[1].0, w[1].1
                )));
            }
        }
        Ok(Self {
            spans,
            loop_period,
            loop_times,
            forced: None,
        })
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn force(&mut self, value: bool) {
        self.forced = Some(value);
    }

    pub fn clear_force(&mut self) {
        self.forced = None;
    }

    pub fn contains(&self, t: Time) -> bool {
        if let Some(v) = self.forced {
            return v;
        }
        let Some(t) = fold_time(t, self.loop_period, self.loop_times) else {
            return false;
        };
        self.spans.iter().any(|&(start, end)| start <= t && t <= end)
    }
}

/// Merges several curves with identical loop parameters into their pointwise
/// sum, sweeping all breakpoints in time order through a min-heap keyed by
/// (time, source, point). O(sum of lengths x log(number of curves)).
pub fn merge_sum(curves: &[StepCurve]) -> Result<StepCurve> {
    let Some(first) = curves.first() else {
        return Ok(StepCurve::empty());
    };
    let period = first.period();
    let times = first.repeat_times();
    for c in curves {
        if c.period() != period || c.repeat_times() != times {
            return Err(SimError::Config(
                "all curves must share loop period and loop times in merge_sum".to_string(),
            ));
        }
    }

    let mut heap: BinaryHeap<Reverse<(Time, usize, usize)>> = BinaryHeap::new();
    for (src, c) in curves.iter().enumerate() {
        if !c.is_empty() {
            heap.push(Reverse((c.times()[0], src, 0)));
        }
    }
    if heap.is_empty() {
        return Ok(StepCurve::empty());
    }

    let mut out_times = Vec::new();
    let mut out_values = Vec::new();
    let mut cur_time: Time = 0;
    let mut sum: FVal = 0.0;

    while let Some(Reverse((t, src, pt))) = heap.pop() {
        if t > cur_time {
            out_times.push(cur_time);
            out_values.push(sum);
            cur_time = t;
        }
        let c = &curves[src];
        if pt > 0 {
            sum -= c.values()[pt - 1];
        }
        sum += c.values()[pt];
        if pt + 1 < c.len() {
            heap.push(Reverse((c.times()[pt + 1], src, pt + 1)));
        }
    }
    out_times.push(cur_time);
    out_values.push(sum);

    StepCurve::new(out_times, out_values, period, times)
}
