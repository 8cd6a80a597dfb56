use crate::model::Stats;
use serde::{Deserialize, Serialize};

/// Running mean and variance (Welford).
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn mean(&self) -> f64 {
        if self.n_vals == 0 { f64::NAN } else { self.mean }
    }

    /// Population variance (divides by `n`).
    pub fn pop_var(&self) -> f64 {
        if self.n_vals == 0 {
            f64::NAN
        } else {
            self.diff_2_sum / self.n_vals as f64
        }
    }
}

/// Outcome of one completed run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Per-policy run index, in issue order.
    pub run: usize,
    pub seed: u64,
    pub days: u32,
    /// Final-day share of people never infected, in percent.
    pub healthy: f64,
    /// Final-day share of people ever infected, in percent.
    pub infected: f64,
    pub dead: f64,
    /// Time-averaged share of people isolated, in percent.
    pub isolated: f64,
}

impl Summary {
    /// Reduce a run's daily stats. Returns `None` for an empty run.
    pub fn from_stats(run: usize, seed: u64, stats: &[Stats]) -> Option<Self> {
        let last = stats.last()?;
        let total = f64::from(last.healthy + last.infected + last.recovered + last.dead);

        let mut isolated = Accumulator::new();
        for day in stats {
            isolated.add(f64::from(day.isolated) / total);
        }

        let healthy = 100.0 * f64::from(last.healthy) / total;
        Some(Self {
            run,
            seed,
            days: stats.len() as u32,
            healthy,
            infected: 100.0 - healthy,
            dead: 100.0 * f64::from(last.dead) / total,
            isolated: 100.0 * isolated.mean(),
        })
    }
}

/// Five-number summary of one outcome over a policy's runs.
///
/// Quartiles interpolate linearly between order statistics. Whiskers reach
/// the most extreme values within 1.5 IQR of the quartiles; anything beyond
/// is listed as an outlier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxPlot {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub n: usize,
    pub outliers: Vec<f64>,
}

impl BoxPlot {
    pub fn new(vals: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = vals.iter().copied().filter(|v| !v.is_nan()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let q1 = quantile(&sorted, 0.25);
        let median = quantile(&sorted, 0.5);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        let (lo_fence, hi_fence) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

        let min = sorted.iter().copied().find(|&v| v >= lo_fence).unwrap_or(q1);
        let max = sorted.iter().copied().rfind(|&v| v <= hi_fence).unwrap_or(q3);
        let outliers = sorted
            .iter()
            .copied()
            .filter(|&v| v < lo_fence || v > hi_fence)
            .collect();

        Some(Self {
            min,
            q1,
            median,
            q3,
            max,
            n: sorted.len(),
            outliers,
        })
    }
}

/// Box plots of each summary outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBoxPlots {
    pub healthy: BoxPlot,
    pub infected: BoxPlot,
    pub dead: BoxPlot,
    pub isolated: BoxPlot,
}

impl OutcomeBoxPlots {
    pub fn new(summaries: &[Summary]) -> Option<Self> {
        let field = |get: fn(&Summary) -> f64| {
            let vals: Vec<f64> = summaries.iter().map(get).collect();
            BoxPlot::new(&vals)
        };
        Some(Self {
            healthy: field(|s| s.healthy)?,
            infected: field(|s| s.infected)?,
            dead: field(|s| s.dead)?,
            isolated: field(|s| s.isolated)?,
        })
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_plot_of_evenly_spaced_values() {
        let plot = BoxPlot::new(&[30.0, 10.0, 50.0, 20.0, 40.0]).expect("non-empty sample");
        assert_eq!(plot.min, 10.0);
        assert_eq!(plot.q1, 20.0);
        assert_eq!(plot.median, 30.0);
        assert_eq!(plot.q3, 40.0);
        assert_eq!(plot.max, 50.0);
        assert_eq!(plot.n, 5);
        assert!(plot.outliers.is_empty());
    }

    #[test]
    fn box_plot_separates_outliers() {
        let plot = BoxPlot::new(&[10.0, 11.0, 12.0, 13.0, 14.0, 100.0]).expect("non-empty sample");
        assert_eq!(plot.outliers, vec![100.0]);
        assert_eq!(plot.max, 14.0);
        assert_eq!(plot.min, 10.0);
    }

    #[test]
    fn box_plot_of_nothing() {
        assert!(BoxPlot::new(&[]).is_none());
    }

    #[test]
    fn accumulator_population_variance() {
        let mut acc = Accumulator::new();
        for val in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add(val);
        }
        assert!((acc.mean() - 5.0).abs() < 1e-12);
        assert!((acc.pop_var() - 4.0).abs() < 1e-12);
    }

    fn day(day: u32, healthy: u32, infected: u32, dead: u32, isolated: u32) -> Stats {
        Stats {
            day,
            healthy,
            infected,
            recovered: 100 - healthy - infected - dead,
            dead,
            immune: 0,
            isolated,
            installed: 0,
            isolated_periods: 0.0,
            lockdown: false,
            r: 0.0,
        }
    }

    #[test]
    fn summary_uses_final_day_and_mean_isolation() {
        let stats = [day(1, 100, 0, 0, 10), day(2, 80, 10, 2, 30)];
        let summary = Summary::from_stats(3, 42, &stats).expect("non-empty run");
        assert_eq!(summary.run, 3);
        assert_eq!(summary.seed, 42);
        assert_eq!(summary.days, 2);
        assert!((summary.healthy - 80.0).abs() < 1e-12);
        assert!((summary.infected - 20.0).abs() < 1e-12);
        assert!((summary.dead - 2.0).abs() < 1e-12);
        assert!((summary.isolated - 20.0).abs() < 1e-12);
    }
}
