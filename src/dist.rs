use crate::rng::Alea;
use anyhow::{Result, bail};
use rand::Rng;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, f64::consts::PI};

const ZIPF_THETA: f64 = 0.99;
const ZIPF_ALPHA: i32 = 100;

/// Bounded integer distribution used for household sizes, durations and so on.
///
/// Every variant rejects draws outside its inclusive `[min, max]` range and
/// redraws. Parameters must keep that range reachable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dist {
    /// Rounded Box-Muller draw spread over `[0, 2 * mean]`.
    Normal { mean: f64, min: u32 },
    /// Knuth's multiplicative sampler.
    Poisson { mean: f64, min: u32, max: u32 },
    /// Zeta-normalized Zipfian over `[min, max]`.
    Zipf { min: u32, max: u32 },
}

impl Dist {
    pub fn min(&self) -> u32 {
        match *self {
            Dist::Normal { min, .. } | Dist::Poisson { min, .. } | Dist::Zipf { min, .. } => min,
        }
    }

    pub fn max(&self) -> u32 {
        match *self {
            Dist::Normal { mean, .. } => (2.0 * mean).floor() as u32,
            Dist::Poisson { max, .. } | Dist::Zipf { max, .. } => max,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Dist::Normal { mean, min } => {
                if !(mean.is_finite() && mean > 0.0) {
                    bail!("mean must be positive, but is {mean}");
                }
                if f64::from(min) > 2.0 * mean {
                    bail!("min must not exceed twice the mean ({}), but is {min}", 2.0 * mean);
                }
            }
            Dist::Poisson { mean, min, max } => {
                if !(mean.is_finite() && mean > 0.0) {
                    bail!("mean must be positive, but is {mean}");
                }
                if min > max {
                    bail!("min ({min}) must not exceed max ({max})");
                }
            }
            Dist::Zipf { min, max } => {
                if min > max {
                    bail!("min ({min}) must not exceed max ({max})");
                }
            }
        }
        Ok(())
    }

    /// Estimate the mean from 10,000 draws of a dedicated stream.
    pub fn estimate_mean(&self) -> f64 {
        let mut rng = Alea::new("mean");
        let n_draws = 10_000;
        let sum: f64 = (0..n_draws).map(|_| f64::from(self.sample(&mut rng))).sum();
        sum / n_draws as f64
    }

    /// Count how often each value comes up in `n_draws` draws.
    pub fn histogram(&self, n_draws: usize) -> BTreeMap<u32, usize> {
        let mut rng = Alea::new("dist");
        let mut bins = BTreeMap::new();
        for _ in 0..n_draws {
            *bins.entry(self.sample(&mut rng)).or_insert(0) += 1;
        }
        bins
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Dist::Normal { mean, .. } => {
                let u1 = nonzero_uniform(rng);
                let u2 = nonzero_uniform(rng);
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
                ((z / 10.0 + 0.5) * 2.0 * mean + 0.5).floor()
            }
            Dist::Poisson { mean, .. } => {
                let limit = (-mean).exp();
                let mut k = 0.0;
                let mut p: f64 = rng.random();
                while p > limit {
                    k += 1.0;
                    p *= rng.random::<f64>();
                }
                k
            }
            Dist::Zipf { min, max } => {
                let items = f64::from(max - min + 1);
                let zetan = zeta(max - min + 1);
                let eta = (1.0 - (2.0 / items).powf(0.01)) / (1.0 - zeta(2) / zetan);
                let u: f64 = rng.random();
                if u * zetan < 1.0 {
                    return f64::from(min);
                }
                f64::from(min) + (items * (eta * u - eta + 1.0).powi(ZIPF_ALPHA)).floor()
            }
        }
    }
}

impl Distribution<u32> for Dist {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        let (min, max) = (f64::from(self.min()), f64::from(self.max()));
        loop {
            let val = self.draw(rng);
            if val.is_finite() && val >= min && val <= max {
                return val as u32;
            }
        }
    }
}

fn nonzero_uniform<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.random();
        if u != 0.0 {
            return u;
        }
    }
}

fn zeta(n: u32) -> f64 {
    (1..=n).map(|i| 1.0 / f64::from(i).powf(ZIPF_THETA)).sum()
}
