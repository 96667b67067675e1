// feature_utils.rs
use crate::db_utils::TransactionRecord;
use crate::metrics_utils::CustomerMetrics;
use serde::{Deserialize, Serialize};

/// The canonical customer feature schema. Training and inference both build
/// matrices through this module, in this exact column order; nothing else in
/// the codebase is allowed to assemble model inputs.
pub const FEATURE_COLUMNS: [&str; 14] = [
    "recency_days",
    "frequency",
    "transaction_count",
    "total_spent",
    "avg_transaction",
    "std_transaction",
    "total_liters",
    "station_diversity",
    "failure_rate",
    "app_usage_rate",
    "customer_age_days",
    "recency_frequency_ratio",
    "value_consistency",
    "engagement_score",
];

/// Per-transaction features feeding the anomaly model.
pub const ANOMALY_FEATURE_COLUMNS: [&str; 5] =
    ["amount", "liter", "pump_price", "hour", "day_of_week"];

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Builds the 14-column feature row for one customer: the 11 base aggregates
/// plus three derived ratios, with non-finite values coerced to 0.
pub fn customer_feature_row(m: &CustomerMetrics) -> Vec<f64> {
    let recency_frequency_ratio = m.recency_days / (m.frequency + 0.1);
    let value_consistency = m.std_transaction / (m.avg_transaction + 1.0);
    let engagement_score =
        m.transaction_count as f64 * m.app_usage_rate * (1.0 / (m.recency_days + 1.0));

    vec![
        m.recency_days,
        m.frequency,
        m.transaction_count as f64,
        m.total_spent,
        m.avg_transaction,
        m.std_transaction,
        m.total_liters,
        m.station_diversity as f64,
        m.failure_rate,
        m.app_usage_rate,
        m.customer_age_days,
        recency_frequency_ratio,
        value_consistency,
        engagement_score,
    ]
    .into_iter()
    .map(finite_or_zero)
    .collect()
}

/// Feature matrix for a metric batch, one row per customer.
pub fn build_customer_features(metrics: &[CustomerMetrics]) -> Vec<Vec<f64>> {
    metrics.iter().map(customer_feature_row).collect()
}

/// Replaces non-finite cells with their column median (computed over the
/// finite cells; a fully non-finite column becomes 0).
pub fn median_fill(matrix: &mut [Vec<f64>]) {
    if matrix.is_empty() {
        return;
    }
    let width = matrix[0].len();
    for col in 0..width {
        let mut finite: Vec<f64> = matrix
            .iter()
            .filter_map(|row| row.get(col).copied().filter(|v| v.is_finite()))
            .collect();
        if finite.len() == matrix.len() {
            continue;
        }
        finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if finite.is_empty() {
            0.0
        } else if finite.len() % 2 == 1 {
            finite[finite.len() / 2]
        } else {
            (finite[finite.len() / 2 - 1] + finite[finite.len() / 2]) / 2.0
        };
        for row in matrix.iter_mut() {
            if let Some(cell) = row.get_mut(col) {
                if !cell.is_finite() {
                    *cell = median;
                }
            }
        }
    }
}

/// Per-transaction anomaly features: amount, liters, pump price, hour of day
/// and day of week (Monday = 0), median-filled.
pub fn build_transaction_features(transactions: &[TransactionRecord]) -> Vec<Vec<f64>> {
    use chrono::{Datelike, Timelike};

    let mut matrix: Vec<Vec<f64>> = transactions
        .iter()
        .map(|t| {
            vec![
                t.amount,
                t.liter,
                t.pump_price,
                t.created_at.hour() as f64,
                t.created_at.weekday().num_days_from_monday() as f64,
            ]
        })
        .collect();
    median_fill(&mut matrix);
    matrix
}

/// Validates a feature matrix against the expected schema width before it is
/// allowed near a model. Ragged rows and non-finite cells are rejected with
/// the offending position named.
pub fn validate_features(
    matrix: &[Vec<f64>],
    expected_width: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    for (i, row) in matrix.iter().enumerate() {
        if row.len() != expected_width {
            return Err(format!(
                "Feature row {} has {} columns, expected {}",
                i,
                row.len(),
                expected_width
            )
            .into());
        }
        for (j, v) in row.iter().enumerate() {
            if !v.is_finite() {
                return Err(format!(
                    "Feature row {} column {} is not finite ({})",
                    i, j, v
                )
                .into());
            }
        }
    }
    Ok(())
}

/// Z-score scaler with serializable fit state. Each model owns one, fit only
/// on that model's training matrix; `transform` rejects any matrix whose
/// width differs from the fit-time schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl StandardScaler {
    /// Fits means and scales column-wise. Population standard deviation, with
    /// zero-variance columns given a unit scale so they transform to 0.
    pub fn fit(matrix: &[Vec<f64>]) -> Result<Self, Box<dyn std::error::Error>> {
        if matrix.is_empty() {
            return Err("Cannot fit a scaler on an empty matrix".into());
        }
        let width = matrix[0].len();
        validate_features(matrix, width)?;

        let n = matrix.len() as f64;
        let mut means = vec![0.0; width];
        for row in matrix {
            for (j, v) in row.iter().enumerate() {
                means[j] += v;
            }
        }
        for m in &mut means {
            *m /= n;
        }

        let mut scales = vec![0.0; width];
        for row in matrix {
            for (j, v) in row.iter().enumerate() {
                scales[j] += (v - means[j]).powi(2);
            }
        }
        for s in &mut scales {
            *s = (*s / n).sqrt();
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Ok(StandardScaler { means, scales })
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }

    /// Transforms a matrix with the fitted parameters, rejecting any schema
    /// mismatch against the fit-time width.
    pub fn transform(
        &self,
        matrix: &[Vec<f64>],
    ) -> Result<Vec<Vec<f64>>, Box<dyn std::error::Error>> {
        validate_features(matrix, self.n_features())?;
        Ok(matrix
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| (v - self.means[j]) / self.scales[j])
                    .collect()
            })
            .collect())
    }

    pub fn fit_transform(
        matrix: &[Vec<f64>],
    ) -> Result<(Self, Vec<Vec<f64>>), Box<dyn std::error::Error>> {
        let scaler = Self::fit(matrix)?;
        let scaled = scaler.transform(matrix)?;
        Ok((scaler, scaled))
    }
}
