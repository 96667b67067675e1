// metrics_utils.rs
use crate::db_utils::TransactionRecord;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// One aggregate row per customer (motorcyclist), recomputed from the raw
/// transaction window on every request. Monetary aggregates cover successful
/// transactions only; `failure_rate` is computed over all of the customer's
/// rows in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerMetrics {
    pub customer_id: String,
    pub transaction_count: u64,
    pub total_spent: f64,
    pub avg_transaction: f64,
    pub std_transaction: f64,
    pub min_transaction: f64,
    pub max_transaction: f64,
    pub total_liters: f64,
    pub avg_liters: f64,
    pub station_diversity: u64,
    pub first_transaction: NaiveDateTime,
    pub last_transaction: NaiveDateTime,
    pub payment_method: String,
    pub app_usage_rate: f64,
    pub failure_rate: f64,
    pub recency_days: f64,
    pub customer_age_days: f64,
    pub frequency: f64,
}

/// 6-month customer lifetime value projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClvProjection {
    pub predicted_transactions: f64,
    pub predicted_clv_6m: f64,
    pub churn_factor: f64,
    pub adjusted_clv_6m: f64,
    pub clv_category: String,
}

/// Heuristic churn risk on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnRisk {
    pub score: f64,
    pub level: String,
}

/// Classic Recency/Frequency/Monetary scoring (1-5 each).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RfmScores {
    pub r_score: u8,
    pub f_score: u8,
    pub m_score: u8,
    pub segment: String,
}

/// The full per-customer analysis consumed by the insights layer.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerProfile {
    pub metrics: CustomerMetrics,
    pub clv: ClvProjection,
    pub churn_risk: ChurnRisk,
    pub rfm: RfmScores,
}

/// Daily-monitoring health score per customer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub customer_id: String,
    pub health_score: f64,
    pub recency_score: f64,
    pub frequency_score: f64,
    pub value_score: f64,
    pub status: String,
}

/// Sample standard deviation (ddof = 1). A single observation has no spread
/// and yields 0 rather than NaN.
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    var.sqrt()
}

/// Percentile ranks in (0, 1], ties sharing their average rank. With
/// `ascending` false the largest value ranks lowest, which is how recency is
/// scored.
pub fn percentile_rank(values: &[f64], ascending: bool) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(Ordering::Equal)
    });
    if !ascending {
        order.reverse();
    }

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg_rank / n as f64;
        }
        i = j + 1;
    }
    ranks
}

/// Linear-interpolated quantile over pre-sorted values.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

/// Groups a transaction window by customer and computes the canonical metric
/// row for each. Customers with no successful transaction in the window carry
/// no monetary signal and are omitted, exactly as a successes-only group-by
/// drops them.
///
/// The recency reference date is the latest `created_at` seen anywhere in the
/// window, so a historical export scores recency relative to its own era
/// rather than the wall clock.
///
/// ```
/// use jalikoi_analytics::db_utils::DbConnect;
/// use jalikoi_analytics::db_utils::AnalysisPeriod;
/// use jalikoi_analytics::config_utils::DbConfig;
/// use jalikoi_analytics::metrics_utils::calculate_customer_metrics;
///
/// #[tokio::main]
/// async fn main() {
///     let config = DbConfig::from_env();
///     let period = AnalysisPeriod::resolve(Some("month"), None, None).unwrap();
///     let transactions = DbConnect::fetch_transactions(&config, &period)
///         .await
///         .expect("fetch failed");
///     let metrics = calculate_customer_metrics(&transactions);
///     println!("{} active customers", metrics.len());
/// }
/// ```
pub fn calculate_customer_metrics(transactions: &[TransactionRecord]) -> Vec<CustomerMetrics> {
    if transactions.is_empty() {
        return Vec::new();
    }

    let reference_date = transactions
        .iter()
        .map(|t| t.created_at)
        .max()
        .unwrap_or_else(|| chrono::Utc::now().naive_utc());

    let mut by_customer: HashMap<&str, Vec<&TransactionRecord>> = HashMap::new();
    for t in transactions {
        by_customer
            .entry(t.motorcyclist_id.as_str())
            .or_default()
            .push(t);
    }

    let mut metrics = Vec::with_capacity(by_customer.len());
    for (customer_id, rows) in by_customer {
        let successes: Vec<&&TransactionRecord> =
            rows.iter().filter(|t| t.is_successful()).collect();
        if successes.is_empty() {
            continue;
        }

        let amounts: Vec<f64> = successes.iter().map(|t| t.amount).collect();
        let total_spent: f64 = amounts.iter().sum();
        let count = successes.len() as f64;
        let avg_transaction = total_spent / count;

        let total_liters: f64 = successes.iter().map(|t| t.liter).sum();
        let mut stations: Vec<&str> = successes.iter().map(|t| t.station_id.as_str()).collect();
        stations.sort_unstable();
        stations.dedup();

        let first_transaction = successes
            .iter()
            .map(|t| t.created_at)
            .min()
            .unwrap_or(reference_date);
        let last_transaction = successes
            .iter()
            .map(|t| t.created_at)
            .max()
            .unwrap_or(reference_date);

        let app_count = successes.iter().filter(|t| t.is_app_transaction()).count();
        let failed = rows.iter().filter(|t| t.is_failed()).count();

        let recency_days = (reference_date - last_transaction).num_seconds() as f64 / 86_400.0;
        let age_days = (last_transaction.date() - first_transaction.date()).num_days() as f64;
        let customer_age_days = if age_days <= 0.0 { 0.1 } else { age_days };
        let frequency = count / customer_age_days;

        metrics.push(CustomerMetrics {
            customer_id: customer_id.to_string(),
            transaction_count: successes.len() as u64,
            total_spent,
            avg_transaction,
            std_transaction: sample_std(&amounts),
            min_transaction: amounts.iter().cloned().fold(f64::INFINITY, f64::min),
            max_transaction: amounts.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            total_liters,
            avg_liters: total_liters / count,
            station_diversity: stations.len() as u64,
            first_transaction,
            last_transaction,
            payment_method: successes
                .first()
                .map(|t| t.payment_method_id.clone())
                .unwrap_or_default(),
            app_usage_rate: app_count as f64 / count,
            failure_rate: failed as f64 / rows.len() as f64,
            recency_days,
            customer_age_days,
            frequency,
        });
    }

    // Deterministic output order regardless of hash-map iteration
    metrics.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
    metrics
}

/// Projects 6-month CLV for every metric row, discounted by a recency-driven
/// churn factor and bucketed by the 33rd/67th percentiles.
pub fn compute_clv(metrics: &[CustomerMetrics]) -> Vec<ClvProjection> {
    let mut projections: Vec<ClvProjection> = metrics
        .iter()
        .map(|m| {
            let predicted_transactions = m.frequency * 180.0;
            let predicted_clv_6m = predicted_transactions * m.avg_transaction;
            let churn_factor = (1.0 - m.recency_days / 30.0).clamp(0.1, 1.0);
            ClvProjection {
                predicted_transactions,
                predicted_clv_6m,
                churn_factor,
                adjusted_clv_6m: predicted_clv_6m * churn_factor,
                clv_category: String::new(),
            }
        })
        .collect();

    let mut sorted: Vec<f64> = projections.iter().map(|p| p.adjusted_clv_6m).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let q33 = quantile(&sorted, 0.33);
    let q67 = quantile(&sorted, 0.67);

    for p in &mut projections {
        p.clv_category = if p.adjusted_clv_6m <= q33 {
            "Low Value".to_string()
        } else if p.adjusted_clv_6m <= q67 {
            "Medium Value".to_string()
        } else {
            "High Value".to_string()
        };
    }
    projections
}

/// Weighted heuristic churn risk: recency up to 40 points, below-par
/// frequency up to 30, failure rate up to 20, below-par volume up to 10.
pub fn compute_churn_risk(metrics: &[CustomerMetrics]) -> Vec<ChurnRisk> {
    let frequencies: Vec<f64> = metrics.iter().map(|m| m.frequency).collect();
    let counts: Vec<f64> = metrics.iter().map(|m| m.transaction_count as f64).collect();
    let freq_rank = percentile_rank(&frequencies, true);
    let count_rank = percentile_rank(&counts, true);

    metrics
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let recency_score = (m.recency_days / 7.0 * 20.0).clamp(0.0, 40.0);
            let frequency_score = (1.0 - freq_rank[i]) * 30.0;
            let failure_score = m.failure_rate * 20.0;
            let value_score = (1.0 - count_rank[i]) * 10.0;
            let score = recency_score + frequency_score + failure_score + value_score;
            let level = if score >= 60.0 {
                "High Risk"
            } else if score >= 35.0 {
                "Medium Risk"
            } else {
                "Low Risk"
            };
            ChurnRisk {
                score,
                level: level.to_string(),
            }
        })
        .collect()
}

fn rfm_score(rank: f64) -> u8 {
    (rank * 5.0).ceil().clamp(1.0, 5.0) as u8
}

/// RFM scores and the platform's segment chain. Branch order is load-bearing:
/// the first matching rule wins.
pub fn compute_rfm(metrics: &[CustomerMetrics]) -> Vec<RfmScores> {
    let recency: Vec<f64> = metrics.iter().map(|m| m.recency_days).collect();
    let frequency: Vec<f64> = metrics.iter().map(|m| m.frequency).collect();
    let monetary: Vec<f64> = metrics.iter().map(|m| m.total_spent).collect();

    let r_rank = percentile_rank(&recency, false);
    let f_rank = percentile_rank(&frequency, true);
    let m_rank = percentile_rank(&monetary, true);

    (0..metrics.len())
        .map(|i| {
            let r = rfm_score(r_rank[i]);
            let f = rfm_score(f_rank[i]);
            let m = rfm_score(m_rank[i]);
            let segment = if r >= 4 && f >= 4 && m >= 4 {
                "Champions"
            } else if r >= 3 && f >= 3 && m >= 3 {
                "Loyal Customers"
            } else if r >= 4 && f <= 2 {
                "Potential Loyalists"
            } else if r <= 2 && f >= 3 && m >= 3 {
                "At Risk"
            } else if r <= 2 && f >= 4 && m >= 4 {
                "Can't Lose Them"
            } else if r <= 2 && f <= 2 && m <= 2 {
                "Lost"
            } else if r == 3 && f <= 2 {
                "Hibernating"
            } else {
                "Need Attention"
            };
            RfmScores {
                r_score: r,
                f_score: f,
                m_score: m,
                segment: segment.to_string(),
            }
        })
        .collect()
}

/// Runs the full per-customer analysis over a transaction window.
pub fn analyze_customers(transactions: &[TransactionRecord]) -> Vec<CustomerProfile> {
    let metrics = calculate_customer_metrics(transactions);
    let clv = compute_clv(&metrics);
    let churn = compute_churn_risk(&metrics);
    let rfm = compute_rfm(&metrics);

    metrics
        .into_iter()
        .zip(clv)
        .zip(churn)
        .zip(rfm)
        .map(|(((metrics, clv), churn_risk), rfm)| CustomerProfile {
            metrics,
            clv,
            churn_risk,
            rfm,
        })
        .collect()
}

/// Daily-monitoring health scores: recency and engagement folded into a
/// 0-100 scale with coarse status labels.
pub fn compute_health_scores(metrics: &[CustomerMetrics]) -> Vec<HealthScore> {
    let spend: Vec<f64> = metrics.iter().map(|m| m.total_spent).collect();
    let spend_rank = percentile_rank(&spend, true);

    metrics
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let recency_score = 100.0 - (m.recency_days / 7.0 * 40.0).clamp(0.0, 100.0);
            let frequency_score = (m.frequency * 20.0).clamp(0.0, 50.0);
            let value_score = spend_rank[i] * 50.0;
            let health_score = (recency_score + frequency_score + value_score) / 2.0;
            let status = if health_score < 30.0 {
                "Critical"
            } else if health_score < 50.0 {
                "Warning"
            } else if health_score < 70.0 {
                "Good"
            } else {
                "Excellent"
            };
            HealthScore {
                customer_id: m.customer_id.clone(),
                health_score,
                recency_score,
                frequency_score,
                value_score,
                status: status.to_string(),
            }
        })
        .collect()
}
