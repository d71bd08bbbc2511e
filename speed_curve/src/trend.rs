//! Least-squares polynomial trend over the mean-speed series.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateSeries;
use crate::ScError;

/// Resolution of the smooth trend curve.
pub const TREND_SAMPLES: usize = 300;

const RANK_TOLERANCE: f64 = 1e-10;

/// Polynomial stored in a centred and scaled variable `u = (x - shift) / scale`
/// so that the normal range of `u` is about `[-1, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial {
    shift: f64,
    scale: f64,
    scaled: Vec<f64>,
}

impl Polynomial {
    pub fn degree(&self) -> usize {
        self.scaled.len().saturating_sub(1)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let u = (x - self.shift) / self.scale;
        self.scaled.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }

    /// Coefficients in raw `x`, lowest power first.
    pub fn coefficients(&self) -> Vec<f64> {
        // Horner in polynomial space: acc <- acc * (x - shift) / scale + c
        let a = -self.shift / self.scale;
        let b = 1.0 / self.scale;
        let mut acc = vec![0.0; self.scaled.len()];
        for &c in self.scaled.iter().rev() {
            let mut next = vec![0.0; acc.len()];
            for (power, &value) in acc.iter().enumerate() {
                if value == 0.0 {
                    continue;
                }
                next[power] += value * a;
                if power + 1 < next.len() {
                    next[power + 1] += value * b;
                }
            }
            next[0] += c;
            acc = next;
        }
        acc
    }
}

/// Fit a polynomial of `degree` to `(xs, ys)` minimising the squared residual.
///
/// Fails with [`ScError::DegenerateFit`] when there are fewer distinct x values
/// than `degree + 1`, or the design matrix is numerically rank deficient.
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Result<Polynomial, ScError> {
    if xs.len() != ys.len() {
        return Err(ScError::InvalidParameter(format!(
            "polyfit needs matching inputs, got {} x and {} y values",
            xs.len(),
            ys.len()
        )));
    }
    if xs.iter().chain(ys).any(|v| !v.is_finite()) {
        return Err(ScError::InvalidParameter(
            "polyfit inputs must be finite".into(),
        ));
    }

    let distinct = count_distinct(xs);
    let degenerate = ScError::DegenerateFit { degree, distinct };
    if distinct < degree + 1 {
        return Err(degenerate);
    }

    let (min, max) = xs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let shift = (min + max) / 2.0;
    let scale = if max > min { (max - min) / 2.0 } else { 1.0 };

    let cols = degree + 1;
    let mut design = Array2::<f64>::zeros((xs.len(), cols));
    for (row, &x) in xs.iter().enumerate() {
        let u = (x - shift) / scale;
        let mut power = 1.0;
        for col in 0..cols {
            design[[row, col]] = power;
            power *= u;
        }
    }
    let rhs = Array1::from_vec(ys.to_vec());

    let scaled = solve_least_squares(design, rhs).ok_or(degenerate)?;
    Ok(Polynomial {
        shift,
        scale,
        scaled,
    })
}

fn count_distinct(xs: &[f64]) -> usize {
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

/// Householder QR solve of an overdetermined (or square) system.
fn solve_least_squares(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Vec<f64>> {
    let (rows, cols) = a.dim();
    if rows < cols {
        return None;
    }

    let mut diag_max: f64 = 0.0;
    for k in 0..cols {
        let norm = (k..rows).map(|i| a[[i, k]].powi(2)).sum::<f64>().sqrt();
        if norm == 0.0 {
            return None;
        }
        let alpha = if a[[k, k]] > 0.0 { -norm } else { norm };

        let mut v: Vec<f64> = (k..rows).map(|i| a[[i, k]]).collect();
        v[0] -= alpha;
        let v_norm_sq: f64 = v.iter().map(|x| x * x).sum();
        if v_norm_sq > 0.0 {
            for j in k..cols {
                let dot: f64 = (k..rows).map(|i| v[i - k] * a[[i, j]]).sum();
                let factor = 2.0 * dot / v_norm_sq;
                for i in k..rows {
                    a[[i, j]] -= factor * v[i - k];
                }
            }
            let dot: f64 = (k..rows).map(|i| v[i - k] * b[i]).sum();
            let factor = 2.0 * dot / v_norm_sq;
            for i in k..rows {
                b[i] -= factor * v[i - k];
            }
        }
        diag_max = diag_max.max(a[[k, k]].abs());
    }

    if (0..cols).any(|k| a[[k, k]].abs() <= RANK_TOLERANCE * diag_max) {
        return None;
    }

    let mut coeffs = vec![0.0; cols];
    for k in (0..cols).rev() {
        let tail: f64 = ((k + 1)..cols).map(|j| a[[k, j]] * coeffs[j]).sum();
        coeffs[k] = (b[k] - tail) / a[[k, k]];
    }
    Some(coeffs)
}

/// `count` evenly spaced values over `[start, end]`, both ends included.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count as f64 - 1.0);
            let mut out: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
            out[count - 1] = end;
            out
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendCurve {
    pub degree: usize,
    /// Lowest power first.
    pub coefficients: Vec<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl TrendCurve {
    /// Evaluate the fitted polynomial at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }
}

/// Fit the mean speeds of `series` and resample the fit on `samples` points.
pub fn fit_trend(
    series: &AggregateSeries,
    degree: usize,
    samples: usize,
) -> Result<TrendCurve, ScError> {
    if samples < 2 {
        return Err(ScError::InvalidParameter(format!(
            "trend resolution must be at least 2 points, got {}",
            samples
        )));
    }
    let xs = series.vehicle_counts();
    let ys = series.means();
    let poly = polyfit(&xs, &ys, degree)?;

    let (min, max) = series.x_bounds();
    let x = linspace(min, max, samples);
    let y = x.iter().map(|&v| poly.evaluate(v)).collect();
    Ok(TrendCurve {
        degree,
        coefficients: poly.coefficients(),
        x,
        y,
    })
}
