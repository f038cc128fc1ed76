//! Chain statistics: acceptance rates, the Gelman-Rubin convergence test and
//! posterior summaries.

use ndarray::{prelude::*, Zip};
use ndarray_stats::{interpolate::Linear, Quantile1dExt, QuantileExt};
use noisy_float::types::n64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proposal::MoveRecord;
use crate::state::MoveIndex;

/// Percentiles at the median and one standard deviation either side of it.
pub const SIGMA_PERCENTILES: [f64; 3] = [15.865525393145708, 50.0, 84.13447460685429];

/// Probability mass enclosed by the mode envelope.
pub const ONE_SIGMA_MASS: f64 = 0.6826894921370859;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceRates {
    /// Gibbs acceptance rate of each free entry; NaN where nothing was proposed.
    pub per_param: Array1<f64>,
    /// Number of Gibbs proposals per free entry.
    pub proposed: Array1<usize>,
    /// Over all moves of both kinds.
    pub global: f64,
    /// Differential-evolution acceptance rate, if any jump was proposed.
    pub vector_jump: Option<f64>,
}

impl AcceptanceRates {
    /// True when every entry's rate lies in `[low, high]`.
    pub fn all_within(&self, low: f64, high: f64) -> bool {
        self.per_param.iter().all(|r| (low..=high).contains(r))
    }
}

/// Counts `accepted / proposed` per free entry and globally.
pub fn acceptance_rates(moves: &[MoveRecord], n_free: usize) -> AcceptanceRates {
    let mut proposed = Array1::<usize>::zeros(n_free);
    let mut accepted = Array1::<usize>::zeros(n_free);
    let (mut jumps, mut jumps_accepted, mut total_accepted) = (0usize, 0usize, 0usize);
    for m in moves {
        total_accepted += m.accepted as usize;
        match m.index {
            MoveIndex::Gibbs(i) if i < n_free => {
                proposed[i] += 1;
                accepted[i] += m.accepted as usize;
            }
            MoveIndex::Gibbs(_) => {}
            MoveIndex::VectorJump => {
                jumps += 1;
                jumps_accepted += m.accepted as usize;
            }
        }
    }
    let per_param = Zip::from(&accepted)
        .and(&proposed)
        .map_collect(|&a, &p| if p == 0 { f64::NAN } else { a as f64 / p as f64 });
    let global = if moves.is_empty() {
        f64::NAN
    } else {
        total_accepted as f64 / moves.len() as f64
    };
    AcceptanceRates {
        per_param,
        proposed,
        global,
        vector_jump: (jumps > 0).then(|| jumps_accepted as f64 / jumps as f64),
    }
}

/// Brooks-Gelman potential scale reduction factor of every free entry.
///
/// `chains` holds one `[n_rows, n_free]` chain per walker, all of equal length
/// and already stripped of burn-in. `npt` is the number of data points fitted,
/// which sets the degrees-of-freedom correction `(d + 3) / (d + 1)` with
/// `d = npt - 1`.
///
/// An entry with no variance within or between walkers scores exactly 1.
pub fn gelman_rubin(chains: &[ArrayView2<f64>], npt: usize) -> Result<Array1<f64>> {
    let m = chains.len();
    if m < 2 {
        return Err(Error::Shape(format!(
            "the Gelman-Rubin test needs at least 2 walkers, got {m}"
        )));
    }
    let (n_rows, n_free) = chains[0].dim();
    if n_rows < 2 {
        return Err(Error::Shape(format!(
            "the Gelman-Rubin test needs at least 2 rows per walker, got {n_rows}"
        )));
    }
    if let Some(c) = chains.iter().find(|c| c.dim() != (n_rows, n_free)) {
        return Err(Error::Shape(format!(
            "walker chains differ in shape: {:?} and {:?}",
            chains[0].dim(),
            c.dim()
        )));
    }

    let mut means = Array2::<f64>::zeros((m, n_free));
    let mut variances = Array2::<f64>::zeros((m, n_free));
    let empty = || Error::Shape("cannot average an empty chain".into());
    for (w, chain) in chains.iter().enumerate() {
        means.row_mut(w).assign(&chain.mean_axis(Axis(0)).ok_or_else(empty)?);
        variances.row_mut(w).assign(&chain.var_axis(Axis(0), 0.0));
    }
    let n = n_rows as f64;
    let m = m as f64;

    let posterior_mean = means.mean_axis(Axis(0)).ok_or_else(empty)?;
    let between = (&means - &posterior_mean.insert_axis(Axis(0)))
        .pow2()
        .sum_axis(Axis(0))
        * (n / (m - 1.0));
    let within = variances.mean_axis(Axis(0)).ok_or_else(empty)?;
    let pooled = &within * ((n - 1.0) / n) + &between * ((m + 1.0) / (m * n));

    let dof = npt.saturating_sub(1) as f64;
    let dof_ratio = (dof + 3.0) / (dof + 1.0);

    Ok(Zip::from(&pooled)
        .and(&within)
        .and(&between)
        .map_collect(|&v, &w, &b| {
            if w == 0.0 {
                if b == 0.0 {
                    1.0
                } else {
                    f64::INFINITY
                }
            } else {
                (dof_ratio * v / w).sqrt()
            }
        }))
}

/// Percentiles (0 to 100) of the finite values, linearly interpolated.
pub fn percentiles(values: ArrayView1<f64>, qs: &[f64]) -> Result<Vec<f64>> {
    let mut finite: Array1<_> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| n64(v))
        .collect();
    if finite.is_empty() {
        return Err(Error::Shape("no finite samples to summarize".into()));
    }
    qs.iter()
        .map(|&q| {
            if !(0.0..=100.0).contains(&q) {
                return Err(Error::Config(format!("percentile {q} is outside [0, 100]")));
            }
            finite
                .quantile_mut(n64(q / 100.0), &Linear)
                .map(|v| v.raw())
                .map_err(|e| Error::Shape(e.to_string()))
        })
        .collect()
}

/// Peak of a kernel density estimate with its one-sigma envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KdeMode {
    pub mode: f64,
    /// Lowest point of the highest-density region holding [`ONE_SIGMA_MASS`].
    pub lower: f64,
    pub upper: f64,
}

/// Gaussian KDE with Scott's bandwidth evaluated on `n_grid` points.
///
/// Samples are binned onto the grid before smoothing. Returns `None` without
/// finite samples.
pub fn kde_mode(values: ArrayView1<f64>, n_grid: usize) -> Option<KdeMode> {
    let finite: Array1<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let n = finite.len();
    if n == 0 {
        return None;
    }
    let std = finite.std(0.0);
    let lo = *finite.min_skipnan();
    let hi = *finite.max_skipnan();
    if std == 0.0 || n_grid < 2 {
        let mean = finite.mean()?;
        return Some(KdeMode {
            mode: mean,
            lower: lo,
            upper: hi,
        });
    }
    let bandwidth = std * (n as f64).powf(-0.2);
    let grid = Array1::linspace(lo - 3.0 * bandwidth, hi + 3.0 * bandwidth, n_grid);
    let dx = grid[1] - grid[0];

    let mut counts = Array1::<f64>::zeros(n_grid);
    for &v in &finite {
        let k = ((v - grid[0]) / dx).round() as usize;
        counts[k.min(n_grid - 1)] += 1.0;
    }
    let density: Array1<f64> = grid
        .iter()
        .map(|&x| {
            Zip::from(&grid)
                .and(&counts)
                .fold(0.0, |acc, &g, &c| {
                    if c == 0.0 {
                        acc
                    } else {
                        acc + c * (-0.5 * ((x - g) / bandwidth).powi(2)).exp()
                    }
                })
        })
        .collect();

    let peak = density.argmax_skipnan().ok()?;
    let total = density.sum();
    let mut order: Vec<usize> = (0..n_grid).collect();
    order.sort_unstable_by(|&a, &b| density[b].total_cmp(&density[a]));
    let (mut lower, mut upper, mut mass) = (grid[peak], grid[peak], 0.0);
    for k in order {
        lower = lower.min(grid[k]);
        upper = upper.max(grid[k]);
        mass += density[k];
        if mass >= ONE_SIGMA_MASS * total {
            break;
        }
    }
    Some(KdeMode {
        mode: grid[peak],
        lower,
        upper,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, array};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn record(accepted: bool, index: MoveIndex) -> MoveRecord {
        MoveRecord { accepted, index }
    }

    #[test]
    fn acceptance_per_index_and_global() {
        let moves = vec![
            record(true, MoveIndex::Gibbs(0)),
            record(false, MoveIndex::Gibbs(0)),
            record(true, MoveIndex::Gibbs(1)),
            record(false, MoveIndex::VectorJump),
            record(true, MoveIndex::VectorJump),
            record(false, MoveIndex::Gibbs(0)),
        ];
        let rates = acceptance_rates(&moves, 3);
        assert_abs_diff_eq!(rates.per_param[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_eq!(rates.per_param[1], 1.0);
        assert!(rates.per_param[2].is_nan());
        assert_eq!(rates.proposed, array![3, 1, 0]);
        assert_eq!(rates.global, 0.5);
        assert_eq!(rates.vector_jump, Some(0.5));
        assert!(!rates.all_within(0.2, 0.4));
    }

    #[test]
    fn gibbs_only_has_no_jump_rate() {
        let rates = acceptance_rates(&[record(true, MoveIndex::Gibbs(0))], 1);
        assert_eq!(rates.vector_jump, None);
        assert!(rates.all_within(0.2, 1.0));
    }

    #[test]
    fn gelman_rubin_hand_computed() {
        let w0 = arr2(&[[0.0, 1.0], [1.0, 2.0], [2.0, 3.0]]);
        let w1 = arr2(&[[2.0, 1.0], [3.0, 2.0], [4.0, 3.0]]);
        let rc = gelman_rubin(&[w0.view(), w1.view()], 3).unwrap();
        assert_abs_diff_eq!(rc[0], 2.9344694769431685, epsilon = 1e-12);
        assert_abs_diff_eq!(rc[1], 1.0540925533894598, epsilon = 1e-12);
    }

    #[test]
    fn gelman_rubin_iid_walkers_approach_one() {
        let normal = Normal::new(3.0, 0.5).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut last = f64::INFINITY;
        for n in [50, 500, 20_000] {
            let chains: Vec<Array2<f64>> = (0..4)
                .map(|_| Array2::from_shape_fn((n, 2), |_| normal.sample(&mut rng)))
                .collect();
            let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
            let rc = gelman_rubin(&views, 10_000).unwrap();
            let worst = *rc.max_skipnan();
            if n == 20_000 {
                assert!((worst - 1.0).abs() < 0.01, "rc = {rc}");
            }
            last = worst;
        }
        assert!(last < 1.01);
    }

    #[test]
    fn gelman_rubin_flags_separated_walkers() {
        let a = Array2::from_shape_fn((100, 1), |(i, _)| (i % 5) as f64);
        let b = &a + 10.0;
        let rc = gelman_rubin(&[a.view(), b.view()], 1000).unwrap();
        assert!(rc[0] > 2.0);
    }

    #[test]
    fn gelman_rubin_constant_entry() {
        let a = Array2::from_elem((10, 1), 2.0);
        let rc = gelman_rubin(&[a.view(), a.view()], 100).unwrap();
        assert_eq!(rc[0], 1.0);
        let b = Array2::from_elem((10, 1), 3.0);
        let rc = gelman_rubin(&[a.view(), b.view()], 100).unwrap();
        assert!(rc[0].is_infinite());
    }

    #[test]
    fn gelman_rubin_needs_matching_walkers() {
        let a = Array2::<f64>::zeros((10, 2));
        let b = Array2::<f64>::zeros((9, 2));
        assert!(gelman_rubin(&[a.view()], 10).is_err());
        assert!(gelman_rubin(&[a.view(), b.view()], 10).is_err());
    }

    #[test]
    fn percentiles_match_linear_interpolation() {
        let values = array![4.0, 1.0, f64::NAN, 3.0, 2.0, 5.0];
        let p = percentiles(values.view(), &[0.0, 25.0, 50.0, 100.0]).unwrap();
        assert_eq!(p, vec![1.0, 2.0, 3.0, 5.0]);
        let p = percentiles(array![0.0, 10.0].view(), &[15.0]).unwrap();
        assert_abs_diff_eq!(p[0], 1.5, epsilon = 1e-12);
        assert!(percentiles(array![f64::NAN].view(), &[50.0]).is_err());
        assert!(percentiles(values.view(), &[101.0]).is_err());
    }

    #[test]
    fn kde_mode_of_gaussian_samples() {
        let normal = Normal::new(-2.0, 0.3).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let samples = Array1::from_shape_fn(20_000, |_| normal.sample(&mut rng));
        let kde = kde_mode(samples.view(), 512).unwrap();
        assert_abs_diff_eq!(kde.mode, -2.0, epsilon = 0.05);
        assert_abs_diff_eq!(kde.upper - kde.mode, 0.3, epsilon = 0.05);
        assert_abs_diff_eq!(kde.mode - kde.lower, 0.3, epsilon = 0.05);
    }

    #[test]
    fn kde_mode_degenerate_inputs() {
        assert!(kde_mode(array![f64::NAN].view(), 64).is_none());
        let flat = kde_mode(array![1.5, 1.5, 1.5].view(), 64).unwrap();
        assert_eq!(flat.mode, 1.5);
        assert_eq!(flat.lower, 1.5);
        assert_eq!(flat.upper, 1.5);
    }
}
