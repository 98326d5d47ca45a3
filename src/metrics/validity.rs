//! Validity checks run on every report.
//!
//! - inter-arrival correctness: Anderson–Darling goodness of fit against an
//!   exponential distribution
//! - independence: Spearman rank correlation of the latency series with a
//!   lagged copy of itself
//! - stationarity: augmented Dickey–Fuller regression with a constant term and
//!   AIC lag selection
//!
//! Each check returns a plain verdict; the underlying statistic is also
//! available for logging.

use crate::utils::{average_ranks, cholesky, cholesky_solve, mean, pearson, student_t_two_sided_p};
use serde::Serialize;

/// p-value above which a series is accepted as independent.
pub const IID_P_THRESHOLD: f64 = 1e-10;

/// Lags tried, in order, once the lag-1 test fails.
pub const REDUCTION_LAGS: [u32; 9] = [2, 5, 10, 25, 50, 100, 200, 500, 1000];

/// Anderson–Darling critical values for the exponential distribution at the
/// 15, 10, 5, 2.5 and 1 % significance levels.
const EXPON_CRITICAL: [f64; 5] = [0.922, 1.078, 1.341, 1.606, 1.957];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AndersonResult {
    pub statistic: f64,
    pub critical_values: [f64; 5],
}

/// Anderson–Darling statistic for an exponential fit with the scale
/// estimated as the sample mean.
pub fn anderson_exponential(samples: &[f64]) -> Option<AndersonResult> {
    if samples.is_empty() {
        return None;
    }
    let scale = mean(samples);
    if !(scale > 0.0) || !scale.is_finite() {
        return None;
    }

    let mut w: Vec<f64> = samples.iter().map(|v| v / scale).collect();
    w.sort_by(|a, b| a.total_cmp(b));

    let n = w.len();
    let nf = n as f64;
    let mut sum = 0.0;
    for i in 0..n {
        // ln F(w_i) + ln(1 - F(w_{n-1-i}))
        let log_cdf = (-(-w[i]).exp_m1()).ln();
        let log_sf = -w[n - 1 - i];
        sum += (2.0 * (i + 1) as f64 - 1.0) / nf * (log_cdf + log_sf);
    }

    let adjust = 1.0 + 0.6 / nf;
    let critical_values = EXPON_CRITICAL.map(|c| (c / adjust * 1000.0).round() / 1000.0);

    Some(AndersonResult {
        statistic: -nf - sum,
        critical_values,
    })
}

/// Whether the transmit timestamps look like a Poisson process.
///
/// Accepted when the statistic stays below twice the 1 % critical value.
/// No samples means not correct.
pub fn check_interarrival(samples: &[f64]) -> bool {
    match anderson_exponential(samples) {
        Some(res) => {
            tracing::debug!(
                "Anderson-Darling A2={:.4} critical={:?} over {} samples",
                res.statistic,
                res.critical_values,
                samples.len()
            );
            res.statistic < 2.0 * res.critical_values[4]
        }
        None => {
            tracing::debug!("No transmit timestamps to check");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpearmanResult {
    pub rho: f64,
    pub p_value: f64,
}

/// Spearman rank correlation with a two-sided p-value from Student's t.
///
/// `None` with fewer than three pairs or when either side is constant.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<SpearmanResult> {
    if x.len() != y.len() || x.len() < 3 {
        return None;
    }
    let rho = pearson(&average_ranks(x), &average_ranks(y))?;
    let dof = (x.len() - 2) as f64;
    let t = rho * (dof / ((rho + 1.0) * (1.0 - rho))).sqrt();
    Some(SpearmanResult {
        rho,
        p_value: student_t_two_sided_p(t, dof),
    })
}

/// Spearman correlation of `series[..n-lag]` against `series[lag..]`.
pub fn lagged_spearman(series: &[f64], lag: usize) -> Option<SpearmanResult> {
    if lag == 0 || lag >= series.len() {
        return None;
    }
    spearman(&series[..series.len() - lag], &series[lag..])
}

fn independent_at(series: &[f64], lag: usize) -> bool {
    match lagged_spearman(series, lag) {
        Some(res) => {
            tracing::debug!("Spearman lag {} rho={:.5} p={:e}", lag, res.rho, res.p_value);
            res.p_value > IID_P_THRESHOLD
        }
        None => false,
    }
}

/// Outcome of the independence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Independence {
    /// Consecutive samples are independent.
    Immediate,
    /// Only every `n`-th sample is independent.
    AtLag(u32),
    /// No tried lag passed; the last one tried is carried along.
    Exhausted { last_lag: u32 },
}

impl Independence {
    pub fn is_iid(&self) -> bool {
        matches!(self, Independence::Immediate)
    }

    /// Factor the client should reduce its sampling by; 0 when already iid.
    ///
    /// An exhausted search reports the last lag tried, which the client
    /// cannot tell apart from a pass at that lag.
    pub fn reduction_lag(&self) -> u32 {
        match self {
            Independence::Immediate => 0,
            Independence::AtLag(lag) => *lag,
            Independence::Exhausted { last_lag } => *last_lag,
        }
    }
}

/// Independence of a chronologically ordered latency series.
pub fn check_independence(series: &[f64]) -> Independence {
    if independent_at(series, 1) {
        return Independence::Immediate;
    }
    for lag in REDUCTION_LAGS {
        if independent_at(series, lag as usize) {
            return Independence::AtLag(lag);
        }
    }
    Independence::Exhausted {
        last_lag: REDUCTION_LAGS[REDUCTION_LAGS.len() - 1],
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdfResult {
    pub statistic: f64,
    pub used_lag: usize,
    pub nobs: usize,
}

/// Upper bound of the AIC lag search: `ceil(12 (n/100)^(1/4))`, capped at
/// `n/2 - 2`. `None` when the series is too short for any lag.
pub fn adf_max_lag(n: usize) -> Option<usize> {
    let schwert = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as i64;
    let cap = (n / 2) as i64 - 2;
    let max_lag = schwert.min(cap);
    if max_lag < 0 {
        None
    } else {
        Some(max_lag as usize)
    }
}

/// Normal equations of `Δx_t = c + γ x_{t-1} + Σ δ_i Δx_{t-i}`.
struct NormalEquations {
    k: usize,
    xtx: Vec<f64>,
    xty: Vec<f64>,
    yy: f64,
    nobs: usize,
}

fn design_row(x: &[f64], dx: &[f64], t: usize, lags: usize, row: &mut Vec<f64>) {
    row.clear();
    row.push(1.0);
    row.push(x[t]);
    row.extend((1..=lags).map(|i| dx[t - i]));
}

impl NormalEquations {
    /// Accumulate over rows `trim..dx.len()` with `lags` lagged differences.
    fn build(x: &[f64], dx: &[f64], lags: usize, trim: usize) -> Self {
        let k = lags + 2;
        let mut xtx = vec![0.0; k * k];
        let mut xty = vec![0.0; k];
        let mut yy = 0.0;
        let mut row = Vec::with_capacity(k);

        for t in trim..dx.len() {
            design_row(x, dx, t, lags, &mut row);
            let y = dx[t];
            for i in 0..k {
                xty[i] += row[i] * y;
                for j in 0..=i {
                    xtx[i * k + j] += row[i] * row[j];
                }
            }
            yy += y * y;
        }
        for i in 0..k {
            for j in (i + 1)..k {
                xtx[i * k + j] = xtx[j * k + i];
            }
        }

        Self {
            k,
            xtx,
            xty,
            yy,
            nobs: dx.len().saturating_sub(trim),
        }
    }

    /// Leading `m × m` block, i.e. the system with `m - 2` lagged differences.
    fn leading(&self, m: usize) -> Vec<f64> {
        let mut sub = Vec::with_capacity(m * m);
        for i in 0..m {
            sub.extend_from_slice(&self.xtx[i * self.k..i * self.k + m]);
        }
        sub
    }
}

/// Augmented Dickey–Fuller t-statistic on `γ`.
///
/// The lag order minimises AIC over `0..=adf_max_lag(n)` on a common sample
/// trimmed by the maximum lag; the chosen order is then refitted on its own
/// largest sample. `None` when the series is too short, constant, or the
/// regression is singular.
pub fn adf_statistic(series: &[f64]) -> Option<AdfResult> {
    let n = series.len();
    let max_lag = adf_max_lag(n)?;

    // The t-statistic is invariant to affine rescaling; standardising keeps
    // the normal equations well conditioned for nanosecond-scale values.
    let m = mean(series);
    let sd = (series.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n as f64).sqrt();
    if !(sd > 0.0) || !sd.is_finite() {
        return None;
    }
    let x: Vec<f64> = series.iter().map(|v| (v - m) / sd).collect();
    let dx: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

    let common = NormalEquations::build(&x, &dx, max_lag, max_lag);
    let nobs = common.nobs as f64;
    let mut best: Option<(f64, usize)> = None;
    for lag in 0..=max_lag {
        let k = lag + 2;
        if common.nobs <= k {
            break;
        }
        let Some(l) = cholesky(&common.leading(k), k) else {
            continue;
        };
        let b = cholesky_solve(&l, k, &common.xty[..k]);
        let ssr = common.yy - b.iter().zip(&common.xty[..k]).map(|(b, g)| b * g).sum::<f64>();
        if !(ssr > 0.0) {
            continue;
        }
        let aic = nobs * (ssr / nobs).ln() + 2.0 * k as f64;
        if best.map_or(true, |(best_aic, _)| aic < best_aic) {
            best = Some((aic, lag));
        }
    }
    let (_, lag) = best?;

    let fit = NormalEquations::build(&x, &dx, lag, lag);
    let k = fit.k;
    if fit.nobs <= k {
        return None;
    }
    let l = cholesky(&fit.xtx, k)?;
    let b = cholesky_solve(&l, k, &fit.xty);

    let mut ssr = 0.0;
    let mut row = Vec::with_capacity(k);
    for t in lag..dx.len() {
        design_row(&x, &dx, t, lag, &mut row);
        let fitted: f64 = row.iter().zip(&b).map(|(r, b)| r * b).sum();
        let resid = dx[t] - fitted;
        ssr += resid * resid;
    }

    let s2 = ssr / (fit.nobs - k) as f64;
    let mut unit = vec![0.0; k];
    unit[1] = 1.0;
    let inv_11 = cholesky_solve(&l, k, &unit)[1];
    let se = (s2 * inv_11).sqrt();
    if !(se > 0.0) || !se.is_finite() {
        return None;
    }

    Some(AdfResult {
        statistic: b[1] / se,
        used_lag: lag,
        nobs: fit.nobs,
    })
}

/// Stationarity verdict: the ADF statistic is negative.
///
/// This is a sign rule, not a test at a significance level. A series too
/// short or too degenerate to fit is reported as not stationary.
///
/// The regression has no trend term. A steady linear ramp under i.i.d. noise
/// leaves a statistic close to zero whose sign follows the noise, so such a
/// series may come out either way. Curved drift, where the increments
/// themselves grow, gives a clearly positive statistic and is rejected.
pub fn check_stationarity(series: &[f64]) -> bool {
    match adf_statistic(series) {
        Some(res) => {
            tracing::debug!(
                "ADF statistic {:.4} (lag {}, {} observations)",
                res.statistic,
                res.used_lag,
                res.nobs
            );
            res.statistic < 0.0
        }
        None => {
            tracing::debug!("ADF regression not possible on {} samples", series.len());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn uniform_series(seed: u64, n: usize, lo: f64, hi: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(lo..hi)).collect()
    }

    #[test]
    fn test_uniform_samples_are_iid() {
        let series = uniform_series(7, 2000, 10_000.0, 50_000.0);
        let verdict = check_independence(&series);
        assert_eq!(verdict, Independence::Immediate);
        assert!(verdict.is_iid());
        assert_eq!(verdict.reduction_lag(), 0);
    }

    #[test]
    fn test_autoregressive_series_needs_reduction() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut series = vec![0.0f64];
        for _ in 1..5000 {
            let prev = series[series.len() - 1];
            series.push(0.9 * prev + rng.gen_range(-1.0..1.0));
        }

        let verdict = check_independence(&series);
        assert!(!verdict.is_iid());
        assert!(
            matches!(verdict, Independence::AtLag(25) | Independence::AtLag(50)),
            "unexpected verdict {:?}",
            verdict
        );
    }

    #[test]
    fn test_random_walk_is_not_iid() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut level = 0.0;
        let series: Vec<f64> = (0..2000)
            .map(|_| {
                level += rng.gen_range(-1.0..1.0);
                level
            })
            .collect();

        let verdict = check_independence(&series);
        assert!(!verdict.is_iid());
        assert!(verdict.reduction_lag() >= 2);
    }

    #[test]
    fn test_exhausted_search_reports_last_lag() {
        // Too short for any lagged test to run.
        let verdict = check_independence(&[1.0, 1.0]);
        assert_eq!(verdict, Independence::Exhausted { last_lag: 1000 });
        assert_eq!(verdict.reduction_lag(), 1000);
        assert!(!verdict.is_iid());
    }

    #[test]
    fn test_spearman_monotone() {
        let x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v * v * v).collect();
        let res = spearman(&x, &y).unwrap();
        assert!((res.rho - 1.0).abs() < 1e-12);
        assert!(res.p_value < IID_P_THRESHOLD);
        assert!(spearman(&x[..2], &y[..2]).is_none());
    }

    #[test]
    fn test_flat_series_is_stationary() {
        let series = uniform_series(5, 1500, 95.0, 105.0);
        let res = adf_statistic(&series).unwrap();
        assert!(res.statistic < -10.0, "statistic {}", res.statistic);
        assert!(check_stationarity(&series));
    }

    #[test]
    fn test_linear_trend_statistic_is_near_zero() {
        let mut stationary = 0;
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let series: Vec<f64> = (0..2000)
                .map(|i| 1000.0 + 10.0 * i as f64 + rng.gen_range(-5.0..5.0))
                .collect();

            let res = adf_statistic(&series).unwrap();
            assert!(res.statistic.abs() < 1.0, "seed {}: statistic {}", seed, res.statistic);
            if check_stationarity(&series) {
                stationary += 1;
            }
        }
        // The verdict on a linear ramp depends on the noise draw.
        assert!(stationary > 0 && stationary < 20, "{} of 20 stationary", stationary);
    }

    #[test]
    fn test_accelerating_trend_is_not_stationary() {
        let mut rng = StdRng::seed_from_u64(9);
        let series: Vec<f64> = (0..1500)
            .map(|i| {
                let i = i as f64;
                1000.0 + 0.002 * i * i + rng.gen_range(-5.0..5.0)
            })
            .collect();

        let res = adf_statistic(&series).unwrap();
        assert!(res.statistic > 0.0, "statistic {}", res.statistic);
        assert!(!check_stationarity(&series));
    }

    #[test]
    fn test_degenerate_series_is_not_stationary() {
        assert!(adf_statistic(&[1.0, 2.0]).is_none());
        assert!(adf_statistic(&[42.0; 200]).is_none());
        assert!(!check_stationarity(&[]));
        assert!(!check_stationarity(&[42.0; 200]));
    }

    #[test]
    fn test_adf_max_lag() {
        assert_eq!(adf_max_lag(100), Some(12));
        assert_eq!(adf_max_lag(1500), Some(24));
        assert_eq!(adf_max_lag(10), Some(3));
        assert_eq!(adf_max_lag(3), None);
    }

    #[test]
    fn test_exponential_gaps_are_correct() {
        let mut rng = StdRng::seed_from_u64(42);
        let gaps: Vec<f64> = (0..4000)
            .map(|_| {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                -u.ln() * 100_000.0
            })
            .collect();

        let res = anderson_exponential(&gaps).unwrap();
        assert!(res.statistic < 2.0 * res.critical_values[4]);
        assert!(check_interarrival(&gaps));
    }

    #[test]
    fn test_constant_gaps_are_not_exponential() {
        assert!(!check_interarrival(&[1000.0; 500]));
        assert!(!check_interarrival(&[]));
    }

    #[test]
    fn test_critical_values_scale_with_n() {
        let res = anderson_exponential(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        // 1.957 / 1.12 = 1.7473...
        assert_eq!(res.critical_values[4], 1.747);
        assert_eq!(res.critical_values[0], 0.823);
    }
}
