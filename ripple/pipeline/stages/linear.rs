use serde::{Deserialize, Serialize};

/// Learning rate used by stage models.
pub const LEARNING_RATE: f64 = 0.1;
/// Gradient-descent epochs used by stage models.
pub const EPOCHS: usize = 500;

/// Goodness of fit on the training rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    /// Mean squared error.
    pub mse: f64,
    /// Coefficient of determination.
    pub r2: f64,
}

/// Linear regression on standardized features.
///
/// Weights start at zero and the bias at the target mean, so fitting the same
/// rows always yields the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl LinearModel {
    /// Fits `targets` from `rows` with batch gradient descent.
    ///
    /// Fails on empty or ragged input and on a non-finite result.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(
        rows: &[Vec<f64>],
        targets: &[f64],
        lr: f64,
        epochs: usize,
    ) -> Result<(Self, FitMetrics), String> {
        if rows.is_empty() || rows.len() != targets.len() {
            return Err(format!("{} rows for {} targets", rows.len(), targets.len()));
        }
        let dim = rows[0].len();
        if rows.iter().any(|row| row.len() != dim) {
            return Err("rows have different widths".into());
        }
        let n = rows.len() as f64;
        let means: Vec<f64> = (0..dim)
            .map(|col| rows.iter().map(|row| row[col]).sum::<f64>() / n)
            .collect();
        let scales: Vec<f64> = (0..dim)
            .map(|col| {
                let var = rows
                    .iter()
                    .map(|row| (row[col] - means[col]).powi(2))
                    .sum::<f64>()
                    / n;
                let std = var.sqrt();
                if std > 1e-12 {
                    std
                } else {
                    1.0
                }
            })
            .collect();
        let standardized: Vec<Vec<f64>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(means.iter().zip(&scales))
                    .map(|(value, (mean, scale))| (value - mean) / scale)
                    .collect()
            })
            .collect();
        let target_mean = targets.iter().sum::<f64>() / n;
        let mut model = Self {
            means,
            scales,
            weights: vec![0.0; dim],
            bias: target_mean,
        };
        for _ in 0..epochs {
            let errors: Vec<f64> = standardized
                .iter()
                .zip(targets)
                .map(|(row, target)| model.raw(row) - target)
                .collect();
            for (idx, weight) in model.weights.iter_mut().enumerate() {
                let grad = errors
                    .iter()
                    .zip(&standardized)
                    .map(|(err, row)| err * row[idx])
                    .sum::<f64>()
                    / n;
                *weight -= lr * grad;
            }
            model.bias -= lr * errors.iter().sum::<f64>() / n;
        }
        let sse: f64 = standardized
            .iter()
            .zip(targets)
            .map(|(row, target)| (model.raw(row) - target).powi(2))
            .sum();
        let sst: f64 = targets.iter().map(|t| (t - target_mean).powi(2)).sum();
        let r2 = if sst > 1e-12 {
            1.0 - sse / sst
        } else if sse < 1e-12 {
            1.0
        } else {
            0.0
        };
        let metrics = FitMetrics { mse: sse / n, r2 };
        let finite = model.bias.is_finite()
            && model.weights.iter().all(|w| w.is_finite())
            && metrics.mse.is_finite()
            && metrics.r2.is_finite();
        if !finite {
            return Err("training diverged to non-finite parameters".into());
        }
        Ok((model, metrics))
    }

    fn raw(&self, standardized: &[f64]) -> f64 {
        standardized
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.bias
    }

    /// Prediction for one raw feature row; `None` when the width is wrong.
    #[must_use]
    pub fn predict(&self, row: &[f64]) -> Option<f64> {
        if row.len() != self.weights.len() {
            return None;
        }
        let standardized: Vec<f64> = row
            .iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect();
        Some(self.raw(&standardized))
    }
}
