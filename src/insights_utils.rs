// insights_utils.rs
use crate::db_utils::{AnalysisPeriod, TransactionRecord};
use crate::metrics_utils::{analyze_customers, CustomerProfile};
use chrono::Timelike;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Resolved window echoed back with every insights payload.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodSummary {
    pub label: String,
    pub start_date: String,
    pub end_date: String,
    pub total_days: i64,
}

/// Percent changes against the adjacent previous window of equal length.
/// A change is absent when the previous value was 0.
#[derive(Debug, Clone, Serialize)]
pub struct OverviewComparison {
    pub revenue_change_pct: Option<f64>,
    pub transaction_change_pct: Option<f64>,
    pub customer_change_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    pub success_rate: f64,
    pub total_revenue: f64,
    pub avg_transaction_value: f64,
    pub total_liters_sold: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<OverviewComparison>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerSummary {
    pub total_customers: u64,
    pub active_customers_30d: u64,
    pub avg_customer_value: f64,
    pub avg_transactions_per_customer: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationSummary {
    pub segment_distribution: BTreeMap<String, u64>,
    pub segment_revenue: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChurnAnalysis {
    pub churn_distribution: BTreeMap<String, u64>,
    pub high_risk_customers: u64,
    pub revenue_at_risk: f64,
    pub churn_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClvSummary {
    pub total_6m_projection: f64,
    pub avg_customer_clv: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopCustomer {
    pub customer_id: String,
    pub total_spent: f64,
    pub transactions: u64,
    pub avg_transaction: f64,
    pub recency_days: f64,
    pub rfm_segment: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationPerformance {
    pub station_id: String,
    pub transactions: u64,
    pub revenue: f64,
    pub liters: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourBucket {
    pub hour: u32,
    pub transactions: u64,
    pub revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyPoint {
    pub date: String,
    pub transactions: u64,
    pub revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeAnalysis {
    pub hourly_distribution: Vec<HourBucket>,
    pub daily_trend: Vec<DailyPoint>,
}

/// The full insights payload for one analysis window.
#[derive(Debug, Clone, Serialize)]
pub struct InsightsReport {
    pub period: PeriodSummary,
    pub overview: Overview,
    pub customers: CustomerSummary,
    pub segmentation: SegmentationSummary,
    pub churn_analysis: ChurnAnalysis,
    pub clv_projection: ClvSummary,
    pub top_customers: Vec<TopCustomer>,
    pub station_performance: Vec<StationPerformance>,
    pub time_analysis: TimeAnalysis,
}

struct WindowTotals {
    transactions: u64,
    revenue: f64,
    customers: u64,
}

fn window_totals(transactions: &[TransactionRecord]) -> WindowTotals {
    let mut customers: Vec<&str> = transactions
        .iter()
        .map(|t| t.motorcyclist_id.as_str())
        .collect();
    customers.sort_unstable();
    customers.dedup();
    WindowTotals {
        transactions: transactions.len() as u64,
        revenue: transactions
            .iter()
            .filter(|t| t.is_successful())
            .map(|t| t.amount)
            .sum(),
        customers: customers.len() as u64,
    }
}

fn percent_change(current: f64, previous: f64) -> Option<f64> {
    if previous == 0.0 {
        None
    } else {
        Some((current - previous) / previous * 100.0)
    }
}

/// Revenue/transaction/customer deltas against the previous window.
pub fn compare_windows(
    current: &[TransactionRecord],
    previous: &[TransactionRecord],
) -> OverviewComparison {
    let cur = window_totals(current);
    let prev = window_totals(previous);
    OverviewComparison {
        revenue_change_pct: percent_change(cur.revenue, prev.revenue),
        transaction_change_pct: percent_change(
            cur.transactions as f64,
            prev.transactions as f64,
        ),
        customer_change_pct: percent_change(cur.customers as f64, prev.customers as f64),
    }
}

fn build_overview(
    transactions: &[TransactionRecord],
    comparison: Option<OverviewComparison>,
) -> Overview {
    let total = transactions.len() as u64;
    let successful = transactions.iter().filter(|t| t.is_successful()).count() as u64;
    let failed = transactions.iter().filter(|t| t.is_failed()).count() as u64;
    let total_revenue: f64 = transactions
        .iter()
        .filter(|t| t.is_successful())
        .map(|t| t.amount)
        .sum();
    let total_liters: f64 = transactions
        .iter()
        .filter(|t| t.is_successful())
        .map(|t| t.liter)
        .sum();
    Overview {
        total_transactions: total,
        successful_transactions: successful,
        failed_transactions: failed,
        success_rate: if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64 * 100.0
        },
        total_revenue,
        avg_transaction_value: if successful == 0 {
            0.0
        } else {
            total_revenue / successful as f64
        },
        total_liters_sold: total_liters,
        currency: "RWF".to_string(),
        comparison,
    }
}

fn build_customer_summary(profiles: &[CustomerProfile]) -> CustomerSummary {
    let n = profiles.len() as f64;
    CustomerSummary {
        total_customers: profiles.len() as u64,
        active_customers_30d: profiles
            .iter()
            .filter(|p| p.metrics.recency_days <= 30.0)
            .count() as u64,
        avg_customer_value: if n == 0.0 {
            0.0
        } else {
            profiles.iter().map(|p| p.metrics.total_spent).sum::<f64>() / n
        },
        avg_transactions_per_customer: if n == 0.0 {
            0.0
        } else {
            profiles
                .iter()
                .map(|p| p.metrics.transaction_count as f64)
                .sum::<f64>()
                / n
        },
    }
}

fn build_segmentation_summary(profiles: &[CustomerProfile]) -> SegmentationSummary {
    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    let mut revenue: BTreeMap<String, f64> = BTreeMap::new();
    for p in profiles {
        *distribution.entry(p.rfm.segment.clone()).or_insert(0) += 1;
        *revenue.entry(p.rfm.segment.clone()).or_insert(0.0) += p.metrics.total_spent;
    }
    SegmentationSummary {
        segment_distribution: distribution,
        segment_revenue: revenue,
    }
}

fn build_churn_analysis(profiles: &[CustomerProfile]) -> ChurnAnalysis {
    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    for p in profiles {
        *distribution.entry(p.churn_risk.level.clone()).or_insert(0) += 1;
    }
    let high: Vec<&CustomerProfile> = profiles
        .iter()
        .filter(|p| p.churn_risk.level == "High Risk")
        .collect();
    ChurnAnalysis {
        churn_distribution: distribution,
        high_risk_customers: high.len() as u64,
        revenue_at_risk: high.iter().map(|p| p.metrics.total_spent).sum(),
        churn_rate: if profiles.is_empty() {
            0.0
        } else {
            high.len() as f64 / profiles.len() as f64 * 100.0
        },
    }
}

fn build_clv_summary(profiles: &[CustomerProfile]) -> ClvSummary {
    let total: f64 = profiles.iter().map(|p| p.clv.adjusted_clv_6m).sum();
    ClvSummary {
        total_6m_projection: total,
        avg_customer_clv: if profiles.is_empty() {
            0.0
        } else {
            total / profiles.len() as f64
        },
    }
}

fn build_top_customers(profiles: &[CustomerProfile], limit: usize) -> Vec<TopCustomer> {
    let mut sorted: Vec<&CustomerProfile> = profiles.iter().collect();
    sorted.sort_by(|a, b| {
        b.metrics
            .total_spent
            .partial_cmp(&a.metrics.total_spent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted
        .into_iter()
        .take(limit)
        .map(|p| TopCustomer {
            customer_id: p.metrics.customer_id.clone(),
            total_spent: p.metrics.total_spent,
            transactions: p.metrics.transaction_count,
            avg_transaction: p.metrics.avg_transaction,
            recency_days: p.metrics.recency_days,
            rfm_segment: p.rfm.segment.clone(),
        })
        .collect()
}

fn build_station_performance(
    transactions: &[TransactionRecord],
    limit: usize,
) -> Vec<StationPerformance> {
    let mut grouped: BTreeMap<&str, (u64, f64, f64)> = BTreeMap::new();
    for t in transactions.iter().filter(|t| t.is_successful()) {
        let entry = grouped.entry(t.station_id.as_str()).or_insert((0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += t.amount;
        entry.2 += t.liter;
    }
    let mut stations: Vec<StationPerformance> = grouped
        .into_iter()
        .map(|(station_id, (transactions, revenue, liters))| StationPerformance {
            station_id: station_id.to_string(),
            transactions,
            revenue,
            liters,
        })
        .collect();
    stations.sort_by(|a, b| {
        b.revenue
            .partial_cmp(&a.revenue)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    stations.truncate(limit);
    stations
}

/// Daily revenue points for the window, oldest first.
pub fn daily_revenue_series(transactions: &[TransactionRecord]) -> Vec<DailyPoint> {
    let mut grouped: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for t in transactions.iter().filter(|t| t.is_successful()) {
        let day = t.created_at.format("%Y-%m-%d").to_string();
        let entry = grouped.entry(day).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += t.amount;
    }
    grouped
        .into_iter()
        .map(|(date, (transactions, revenue))| DailyPoint {
            date,
            transactions,
            revenue,
        })
        .collect()
}

fn build_time_analysis(transactions: &[TransactionRecord]) -> TimeAnalysis {
    let mut hourly = vec![(0u64, 0.0f64); 24];
    for t in transactions.iter().filter(|t| t.is_successful()) {
        let h = t.created_at.hour() as usize;
        hourly[h].0 += 1;
        hourly[h].1 += t.amount;
    }
    let hourly_distribution = hourly
        .into_iter()
        .enumerate()
        .map(|(hour, (transactions, revenue))| HourBucket {
            hour: hour as u32,
            transactions,
            revenue,
        })
        .collect();

    let mut daily = daily_revenue_series(transactions);
    if daily.len() > 7 {
        daily.drain(..daily.len() - 7);
    }
    TimeAnalysis {
        hourly_distribution,
        daily_trend: daily,
    }
}

/// Builds the full insights payload from a raw transaction window. The
/// revenue figures sum successful transactions only; callers decide whether
/// an empty window is an error.
pub fn generate_insights(
    transactions: &[TransactionRecord],
    period: &AnalysisPeriod,
    previous: Option<&[TransactionRecord]>,
) -> InsightsReport {
    let profiles = analyze_customers(transactions);
    let comparison = previous.map(|prev| compare_windows(transactions, prev));
    InsightsReport {
        period: PeriodSummary {
            label: period.label.clone(),
            start_date: period.start_string(),
            end_date: period.end_string(),
            total_days: period.total_days(),
        },
        overview: build_overview(transactions, comparison),
        customers: build_customer_summary(&profiles),
        segmentation: build_segmentation_summary(&profiles),
        churn_analysis: build_churn_analysis(&profiles),
        clv_projection: build_clv_summary(&profiles),
        top_customers: build_top_customers(&profiles, 10),
        station_performance: build_station_performance(transactions, 5),
        time_analysis: build_time_analysis(transactions),
    }
}

/// Chart-ready {labels, values} series for the visualization endpoint.
/// Unknown chart types are a validation error, not a fallback.
pub fn visualization_data(
    chart_type: &str,
    transactions: &[TransactionRecord],
) -> Result<Value, Box<dyn std::error::Error>> {
    let revenue_series = || -> Value {
        let daily = daily_revenue_series(transactions);
        json!({
            "labels": daily.iter().map(|d| d.date.clone()).collect::<Vec<_>>(),
            "values": daily.iter().map(|d| d.revenue).collect::<Vec<_>>(),
        })
    };
    let segment_series = |profiles: &[CustomerProfile]| -> Value {
        let summary = build_segmentation_summary(profiles);
        json!({
            "labels": summary.segment_distribution.keys().cloned().collect::<Vec<_>>(),
            "values": summary.segment_distribution.values().copied().collect::<Vec<_>>(),
        })
    };
    let churn_series = |profiles: &[CustomerProfile]| -> Value {
        let analysis = build_churn_analysis(profiles);
        json!({
            "labels": analysis.churn_distribution.keys().cloned().collect::<Vec<_>>(),
            "values": analysis.churn_distribution.values().copied().collect::<Vec<_>>(),
        })
    };

    match chart_type {
        "revenue" => Ok(json!({ "chart_type": "revenue", "series": revenue_series() })),
        "segmentation" => {
            let profiles = analyze_customers(transactions);
            Ok(json!({ "chart_type": "segmentation", "series": segment_series(&profiles) }))
        }
        "churn" => {
            let profiles = analyze_customers(transactions);
            Ok(json!({ "chart_type": "churn", "series": churn_series(&profiles) }))
        }
        "all" => {
            let profiles = analyze_customers(transactions);
            Ok(json!({
                "chart_type": "all",
                "revenue": revenue_series(),
                "segmentation": segment_series(&profiles),
                "churn": churn_series(&profiles),
            }))
        }
        other => Err(format!(
            "Unknown chart_type '{}'. Valid types: revenue, segmentation, churn, all",
            other
        )
        .into()),
    }
}
