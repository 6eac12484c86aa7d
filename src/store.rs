use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::metrics::Metric;

/// Identity of one measurement series. One series per code location,
/// process, thread and metric, with an optional call-tree node id for
/// tree-addressed measurements.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub file_id: u32,
    pub line: u32,
    pub region_name: String,
    pub rank: u64,
    pub thread: u32,
    pub metric: Metric,
    pub node_id: Option<u32>,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{}:{}:{}:{}:{}:{}",
            self.file_id,
            self.line,
            self.region_name,
            self.rank,
            self.thread,
            self.metric.wire_name()
        )?;
        if let Some(node_id) = self.node_id {
            write!(f, ":{}", node_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    SumSqr,
    Avg,
    StdDev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Zero,
    Constant,
    Linear,
}

/// Iteration-indexed time-series store with windowed reduction.
///
/// Values are keyed by series and iteration number. Queries reduce over a
/// half-open iteration window, synthesizing values for iterations without
/// a sample according to the interpolation policy.
pub struct SeriesStore {
    data: BTreeMap<SeriesKey, BTreeMap<u32, i64>>,
    now: u32,
    last_written: u32,
    window: (u32, u32),
    default_op: Reduction,
    default_interp: Interpolation,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesStore {
    pub fn new() -> Self {
        SeriesStore {
            data: BTreeMap::new(),
            now: 0,
            last_written: 0,
            window: (0, 1),
            default_op: Reduction::Sum,
            default_interp: Interpolation::Zero,
        }
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.now = iteration;
    }

    pub fn current_iteration(&self) -> u32 {
        self.now
    }

    pub fn set_default_reduction(&mut self, op: Reduction) {
        self.default_op = op;
    }

    pub fn set_interpolation(&mut self, interp: Interpolation) {
        self.default_interp = interp;
    }

    /// Stores a value for the current iteration. Writing at or past the
    /// last written iteration resets the query window to cover just that
    /// iteration.
    pub fn store(&mut self, key: SeriesKey, value: i64) {
        if self.now >= self.last_written {
            self.last_written = self.now;
            self.window = (self.now, self.now + 1);
        }
        self.data.entry(key).or_default().insert(self.now, value);
    }

    /// Drops the current iteration's sample of one series, if present.
    pub fn erase_current(&mut self, key: &SeriesKey) {
        if let Some(series) = self.data.get_mut(key) {
            series.remove(&self.now);
        }
    }

    pub fn clean(&mut self) {
        self.data.clear();
    }

    pub fn set_window(&mut self, begin: u32, end: u32) -> Result<()> {
        if self.window == (begin, end) {
            return Ok(());
        }
        debug!(begin, end, "setting store query window");
        if end < begin || end > self.last_written + 1 {
            return Err(AgentError::InvalidWindow {
                left: begin,
                right: end,
                last_written: self.last_written,
            });
        }
        self.window = (begin, end);
        Ok(())
    }

    pub fn window(&self) -> (u32, u32) {
        self.window
    }

    fn series(&self, key: &SeriesKey) -> Option<&BTreeMap<u32, i64>> {
        match self.data.get(key) {
            Some(series) if !series.is_empty() => Some(series),
            Some(_) => {
                debug!(%key, "series found but empty");
                None
            }
            None => {
                debug!(%key, "series not found");
                None
            }
        }
    }

    /// Reduces one series over `[left, right)` with the given policy.
    /// Returns `None` if the series is missing or empty.
    pub fn query(
        &self,
        op: Reduction,
        interp: Interpolation,
        left: u32,
        right: u32,
        key: &SeriesKey,
    ) -> Option<i64> {
        let series = self.series(key)?;
        let num_elements = (right - left + 1) as f64;
        let interp = match interp {
            Interpolation::Linear => {
                warn!("linear interpolation is not implemented, falling back to zeros");
                Interpolation::Zero
            }
            other => other,
        };

        let (sum, sum_sqr, _) = reduce(series, left, right, interp, 0.0);
        let result = match op {
            Reduction::Sum => sum,
            Reduction::SumSqr => sum_sqr,
            Reduction::Avg => sum / num_elements,
            Reduction::StdDev => {
                let mean = sum / num_elements;
                let (_, _, stddev) = reduce(series, left, right, interp, mean);
                (stddev / num_elements).sqrt()
            }
        };
        Some(result as i64)
    }

    /// Default-window, default-policy read. Missing series read as 0.
    pub fn get(&self, key: &SeriesKey) -> i64 {
        self.query(
            self.default_op,
            self.default_interp,
            self.window.0,
            self.window.1,
            key,
        )
        .unwrap_or(0)
    }

    /// Like `get`, but missing series read as -1 so callers can tell
    /// absence from a measured zero.
    pub fn try_get(&self, key: &SeriesKey) -> i64 {
        self.query(
            self.default_op,
            self.default_interp,
            self.window.0,
            self.window.1,
            key,
        )
        .unwrap_or(-1)
    }

    /// Sample stored at the most recent iteration of the series.
    pub fn last_value(&self, key: &SeriesKey) -> Option<i64> {
        self.series(key)
            .and_then(|series| series.values().next_back().copied())
    }

    /// Sample stored at one specific iteration.
    pub fn value_at(&self, key: &SeriesKey, iteration: u32) -> Option<i64> {
        self.series(key).and_then(|series| series.get(&iteration).copied())
    }

    /// Reads the whole series up to the current iteration, carrying the
    /// last seen value through iterations without a sample.
    pub fn all_values(&self, key: &SeriesKey) -> Option<Vec<i64>> {
        let series = self.series(key)?;
        let mut out = Vec::new();
        let mut next_iter = 0u32;
        let mut last_value = 0i64;
        for (&x, &y) in series {
            for _ in next_iter..x {
                out.push(last_value);
            }
            out.push(y);
            next_iter = x + 1;
            last_value = y;
        }
        for _ in next_iter..self.now {
            out.push(last_value);
        }
        Some(out)
    }
}

/// One pass over a series window. Real samples are accumulated directly;
/// gaps at the beginning, middle and end of the window are filled by
/// `interpolate_and_reduce`. The synthesized-plus-real point count must
/// equal the window length or the whole reduction is discarded.
fn reduce(
    series: &BTreeMap<u32, i64>,
    left: u32,
    right: u32,
    interp: Interpolation,
    mean: f64,
) -> (f64, f64, f64) {
    let left = left as i64;
    let right = right as i64;
    let mut num_elements = 0i64;
    let mut last_left_y = 0i64;
    let mut sum = 0.0;
    let mut sum_sqr = 0.0;
    let mut stddev = 0.0;

    let mut iter = series.iter().map(|(&x, &y)| (x as i64, y)).peekable();
    while let Some(&(x, y)) = iter.peek() {
        if x >= left {
            break;
        }
        last_left_y = y;
        iter.next();
    }

    // Gap at the beginning of the window.
    let (first_in_range, right_y) = match iter.peek() {
        Some(&(x, y)) => (x.min(right), y),
        None => (right, 0),
    };
    sum += interpolate_and_reduce(left, last_left_y, first_in_range, right_y, Reduction::Sum, interp, 0.0);
    sum_sqr += interpolate_and_reduce(
        left,
        last_left_y,
        first_in_range,
        right_y,
        Reduction::SumSqr,
        interp,
        0.0,
    );
    stddev += interpolate_and_reduce(
        left,
        last_left_y,
        first_in_range,
        right_y,
        Reduction::StdDev,
        interp,
        mean,
    );
    num_elements += first_in_range - left;
    let mut last_left_x = first_in_range;

    for (x, y) in iter {
        if x >= left && x < right {
            // Gap in the middle of the window.
            if x - last_left_x > 1 {
                sum += interpolate_and_reduce(last_left_x, last_left_y, x - 1, y, Reduction::Sum, interp, 0.0);
                sum_sqr +=
                    interpolate_and_reduce(last_left_x, last_left_y, x - 1, y, Reduction::SumSqr, interp, 0.0);
                stddev +=
                    interpolate_and_reduce(last_left_x, last_left_y, x - 1, y, Reduction::StdDev, interp, mean);
                num_elements += x - last_left_x - 1;
            }
            num_elements += 1;
            let value = y as f64;
            sum += value;
            sum_sqr += value * value;
            stddev += (value - mean) * (value - mean);
            last_left_y = y;
            last_left_x = x;
        }
        if x > right {
            break;
        }
    }

    // Gap at the end of the window, carried at the last seen value.
    if right - last_left_x > 1 {
        sum += interpolate_and_reduce(
            last_left_x,
            last_left_y,
            right - 1,
            last_left_y,
            Reduction::Sum,
            interp,
            0.0,
        );
        sum_sqr += interpolate_and_reduce(
            last_left_x,
            last_left_y,
            right - 1,
            last_left_y,
            Reduction::SumSqr,
            interp,
            0.0,
        );
        stddev += interpolate_and_reduce(
            last_left_x,
            last_left_y,
            right - 1,
            last_left_y,
            Reduction::StdDev,
            interp,
            mean,
        );
        num_elements += right - last_left_x - 1;
    }

    if num_elements != right - left {
        warn!(
            num_elements,
            left,
            right,
            series_len = series.len(),
            "reduction consumed a wrong number of window elements"
        );
        debug_assert!(false, "window reduction element count mismatch");
        return (0.0, 0.0, 0.0);
    }
    (sum, sum_sqr, stddev)
}

fn interpolate_and_reduce(
    left_x: i64,
    left_y: i64,
    right_x: i64,
    right_y: i64,
    op: Reduction,
    interp: Interpolation,
    mean: f64,
) -> f64 {
    let value = match interp {
        Interpolation::Constant => ((left_y + right_y) / 2) as f64,
        Interpolation::Zero | Interpolation::Linear => 0.0,
    };

    let num_points = (right_x - left_x) as f64;
    if num_points <= 0.0 {
        return 0.0;
    }

    match op {
        Reduction::Sum => value * num_points,
        Reduction::Avg => value,
        Reduction::StdDev => (value - mean) * (value - mean) * num_points,
        Reduction::SumSqr => value * value * num_points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(metric: Metric) -> SeriesKey {
        SeriesKey {
            file_id: 1,
            line: 10,
            region_name: "compute".to_string(),
            rank: 0,
            thread: 0,
            metric,
            node_id: None,
        }
    }

    #[test]
    fn key_renders_legacy_format() {
        let flat = key(Metric::ExecutionTime);
        assert_eq!(flat.to_string(), ":1:10:compute:0:0:execution_time");
        let tree = SeriesKey {
            node_id: Some(7),
            ..key(Metric::ExecutionTime)
        };
        assert_eq!(tree.to_string(), ":1:10:compute:0:0:execution_time:7");
    }

    #[test]
    fn store_and_read_back_single_iteration() {
        let mut store = SeriesStore::new();
        store.store(key(Metric::ExecutionTime), 1234);
        assert_eq!(store.get(&key(Metric::ExecutionTime)), 1234);
        assert_eq!(store.try_get(&key(Metric::ExecutionTime)), 1234);
    }

    #[test]
    fn missing_series_sentinels() {
        let store = SeriesStore::new();
        assert_eq!(store.get(&key(Metric::ExecutionTime)), 0);
        assert_eq!(store.try_get(&key(Metric::ExecutionTime)), -1);
    }

    #[test]
    fn last_write_in_iteration_wins() {
        let mut store = SeriesStore::new();
        store.store(key(Metric::ExecutionTime), 100);
        store.store(key(Metric::ExecutionTime), 250);
        assert_eq!(store.get(&key(Metric::ExecutionTime)), 250);
    }

    #[test]
    fn store_resets_window_to_current_iteration() {
        let mut store = SeriesStore::new();
        store.store(key(Metric::ExecutionTime), 1);
        store.set_iteration(5);
        store.store(key(Metric::ExecutionTime), 9);
        assert_eq!(store.window(), (5, 6));
        assert_eq!(store.get(&key(Metric::ExecutionTime)), 9);
    }

    fn sparse_store() -> (SeriesStore, SeriesKey) {
        // Samples 100 at iteration 0 and 300 at iteration 2; iteration 1
        // has no sample.
        let mut store = SeriesStore::new();
        store.set_iteration(0);
        store.store(key(Metric::ExecutionTime), 100);
        store.set_iteration(2);
        store.store(key(Metric::ExecutionTime), 300);
        (store, key(Metric::ExecutionTime))
    }

    #[test]
    fn sum_with_zero_interpolation_skips_the_gap() {
        let (store, k) = sparse_store();
        assert_eq!(
            store.query(Reduction::Sum, Interpolation::Zero, 0, 3, &k),
            Some(400)
        );
    }

    #[test]
    fn sum_with_constant_interpolation_fills_the_gap() {
        let (store, k) = sparse_store();
        // Gap point synthesized as (100 + 300) / 2 = 200.
        assert_eq!(
            store.query(Reduction::Sum, Interpolation::Constant, 0, 3, &k),
            Some(600)
        );
    }

    #[test]
    fn linear_interpolation_degrades_to_zeros() {
        let (store, k) = sparse_store();
        assert_eq!(
            store.query(Reduction::Sum, Interpolation::Linear, 0, 3, &k),
            store.query(Reduction::Sum, Interpolation::Zero, 0, 3, &k),
        );
    }

    #[test]
    fn avg_divides_by_window_length_plus_one() {
        let (store, k) = sparse_store();
        // 400 over a [0,3) window divides by 3 - 0 + 1.
        assert_eq!(
            store.query(Reduction::Avg, Interpolation::Zero, 0, 3, &k),
            Some(100)
        );
    }

    #[test]
    fn stddev_uses_two_pass_mean() {
        let mut store = SeriesStore::new();
        let k = key(Metric::ExecutionTime);
        for (i, v) in [10i64, 10, 10, 10].iter().enumerate() {
            store.set_iteration(i as u32);
            store.store(k.clone(), *v);
        }
        // Mean over [0,4) is 40 / 5 = 8; deviations are 4 * (10-8)^2 = 16;
        // sqrt(16 / 5) truncates to 1.
        assert_eq!(
            store.query(Reduction::StdDev, Interpolation::Zero, 0, 4, &k),
            Some(1)
        );
    }

    #[test]
    fn window_validation() {
        let mut store = SeriesStore::new();
        store.set_iteration(3);
        store.store(key(Metric::ExecutionTime), 1);
        assert!(store.set_window(0, 4).is_ok());
        assert!(store.set_window(0, 5).is_err());
        assert!(store.set_window(3, 2).is_err());
    }

    #[test]
    fn erase_drops_only_the_current_iteration() {
        let mut store = SeriesStore::new();
        let k = key(Metric::ExecutionTime);
        store.set_iteration(0);
        store.store(k.clone(), 5);
        store.set_iteration(1);
        store.store(k.clone(), 6);
        store.erase_current(&k);
        assert_eq!(store.value_at(&k, 0), Some(5));
        assert_eq!(store.value_at(&k, 1), None);
    }

    #[test]
    fn all_values_gap_fills_with_last_value() {
        let mut store = SeriesStore::new();
        let k = key(Metric::ExecutionTime);
        store.set_iteration(1);
        store.store(k.clone(), 7);
        store.set_iteration(4);
        store.store(k.clone(), 9);
        store.set_iteration(6);
        assert_eq!(store.all_values(&k), Some(vec![0, 7, 7, 7, 9, 9]));
    }
}
