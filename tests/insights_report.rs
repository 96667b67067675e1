//! The insights payload: overview totals, rankings, time analysis,
//! window-over-window comparison and chart series.

use chrono::NaiveDateTime;
use jalikoi_analytics::db_utils::{
    AnalysisPeriod, TransactionRecord, STATUS_FAILED, STATUS_SUCCESS,
};
use jalikoi_analytics::insights_utils::{
    compare_windows, daily_revenue_series, generate_insights, visualization_data,
};

fn txn(
    id: u64,
    customer: &str,
    station: &str,
    amount: f64,
    liter: f64,
    status: i32,
    when: &str,
) -> TransactionRecord {
    TransactionRecord {
        id,
        station_id: station.to_string(),
        motorcyclist_id: customer.to_string(),
        source: "APP".to_string(),
        fuel_type: "Petrol".to_string(),
        liter,
        pump_price: 1_700.0,
        amount,
        payment_status: status,
        payment_method_id: "1".to_string(),
        created_at: NaiveDateTime::parse_from_str(when, "%Y-%m-%d %H:%M:%S").unwrap(),
    }
}

/// One week of traffic: five successes, two failures, one customer who never
/// managed a successful payment.
fn week_of_sales() -> Vec<TransactionRecord> {
    vec![
        txn(1, "C1", "S1", 10_000.0, 6.0, STATUS_SUCCESS, "2025-06-01 08:00:00"),
        txn(2, "C1", "S1", 8_000.0, 4.5, STATUS_SUCCESS, "2025-06-03 12:00:00"),
        txn(3, "C1", "S2", 12_000.0, 7.0, STATUS_SUCCESS, "2025-06-06 18:30:00"),
        txn(4, "C2", "S2", 5_000.0, 3.0, STATUS_SUCCESS, "2025-06-02 09:15:00"),
        txn(5, "C2", "S1", 7_000.0, 4.0, STATUS_FAILED, "2025-06-04 10:00:00"),
        txn(6, "C3", "S3", 20_000.0, 11.0, STATUS_SUCCESS, "2025-06-05 14:45:00"),
        txn(7, "C4", "S1", 4_000.0, 2.5, STATUS_FAILED, "2025-06-06 16:00:00"),
    ]
}

fn week_period() -> AnalysisPeriod {
    AnalysisPeriod::resolve(None, Some("2025-06-01"), Some("2025-06-07")).unwrap()
}

/// Revenue and liters sum successful transactions only.
#[test]
fn overview_counts_successes_and_failures() {
    let report = generate_insights(&week_of_sales(), &week_period(), None);
    let o = &report.overview;

    assert_eq!(o.total_transactions, 7);
    assert_eq!(o.successful_transactions, 5);
    assert_eq!(o.failed_transactions, 2);
    assert!((o.success_rate - 500.0 / 7.0).abs() < 1e-9);
    assert!((o.total_revenue - 55_000.0).abs() < 1e-9);
    assert!((o.avg_transaction_value - 11_000.0).abs() < 1e-9);
    assert!((o.total_liters_sold - 31.5).abs() < 1e-9);
    assert_eq!(o.currency, "RWF");

    assert_eq!(report.period.label, "custom");
    assert_eq!(report.period.start_date, "2025-06-01 00:00:00");
    assert_eq!(report.period.end_date, "2025-06-08 00:00:00");
    assert_eq!(report.period.total_days, 7);
}

/// Customers who never paid successfully are not profiled.
#[test]
fn customer_summary_covers_profiled_customers() {
    let report = generate_insights(&week_of_sales(), &week_period(), None);
    let c = &report.customers;

    assert_eq!(c.total_customers, 3, "C4 never succeeded");
    assert_eq!(c.active_customers_30d, 3);
    assert!((c.avg_customer_value - 55_000.0 / 3.0).abs() < 1e-9);
    assert!((c.avg_transactions_per_customer - 5.0 / 3.0).abs() < 1e-9);
}

/// Top customers by spend, stations by revenue.
#[test]
fn report_ranks_customers_and_stations() {
    let report = generate_insights(&week_of_sales(), &week_period(), None);

    let ids: Vec<&str> = report
        .top_customers
        .iter()
        .map(|c| c.customer_id.as_str())
        .collect();
    assert_eq!(ids, vec!["C1", "C3", "C2"]);
    assert!((report.top_customers[0].total_spent - 30_000.0).abs() < 1e-9);
    assert_eq!(report.top_customers[0].transactions, 3);

    let stations: Vec<(&str, f64)> = report
        .station_performance
        .iter()
        .map(|s| (s.station_id.as_str(), s.revenue))
        .collect();
    assert_eq!(
        stations,
        vec![("S3", 20_000.0), ("S1", 18_000.0), ("S2", 17_000.0)]
    );
    assert_eq!(report.station_performance[1].transactions, 2);
    assert!((report.station_performance[1].liters - 10.5).abs() < 1e-9);
}

/// 24 hourly buckets and an oldest-first daily trend without failed payments.
#[test]
fn time_analysis_buckets_by_hour_and_day() {
    let report = generate_insights(&week_of_sales(), &week_period(), None);
    let t = &report.time_analysis;

    assert_eq!(t.hourly_distribution.len(), 24);
    assert_eq!(t.hourly_distribution[8].hour, 8);
    assert_eq!(t.hourly_distribution[8].transactions, 1);
    assert!((t.hourly_distribution[8].revenue - 10_000.0).abs() < 1e-9);
    assert_eq!(t.hourly_distribution[14].transactions, 1);
    assert_eq!(t.hourly_distribution[0].transactions, 0);
    // 16:00 on June 6 was a failed payment.
    assert_eq!(t.hourly_distribution[16].transactions, 0);

    let days: Vec<&str> = t.daily_trend.iter().map(|d| d.date.as_str()).collect();
    assert_eq!(
        days,
        vec!["2025-06-01", "2025-06-02", "2025-06-03", "2025-06-05", "2025-06-06"]
    );
    assert!((t.daily_trend[4].revenue - 12_000.0).abs() < 1e-9);
}

/// The daily trend keeps only the last seven days of a longer window.
#[test]
fn daily_trend_is_capped_at_seven_days() {
    let transactions: Vec<TransactionRecord> = (1..=9u64)
        .map(|d| {
            txn(
                d,
                "C1",
                "S1",
                1_000.0 * d as f64,
                1.0,
                STATUS_SUCCESS,
                &format!("2025-06-{d:02} 10:00:00"),
            )
        })
        .collect();
    let period = AnalysisPeriod::resolve(None, Some("2025-06-01"), Some("2025-06-09")).unwrap();
    let report = generate_insights(&transactions, &period, None);

    assert_eq!(daily_revenue_series(&transactions).len(), 9);
    assert_eq!(report.time_analysis.daily_trend.len(), 7);
    assert_eq!(report.time_analysis.daily_trend[0].date, "2025-06-03");
}

/// Percent changes against a previous window of half the size.
#[test]
fn comparison_measures_window_over_window() {
    let previous = vec![
        txn(90, "C1", "S1", 15_000.0, 9.0, STATUS_SUCCESS, "2025-05-26 10:00:00"),
        txn(91, "C9", "S2", 12_500.0, 7.5, STATUS_SUCCESS, "2025-05-28 11:00:00"),
    ];
    let current = week_of_sales();

    let comparison = compare_windows(&current, &previous);
    assert_eq!(comparison.revenue_change_pct, Some(100.0));
    assert_eq!(comparison.transaction_change_pct, Some(250.0));
    assert_eq!(comparison.customer_change_pct, Some(100.0));

    let report = generate_insights(&current, &week_period(), Some(&previous));
    let embedded = report.overview.comparison.as_ref().unwrap();
    assert_eq!(embedded.revenue_change_pct, Some(100.0));
}

/// No previous activity means no percentages, and the field disappears from
/// the serialized payload entirely.
#[test]
fn comparison_absent_without_previous_activity() {
    let comparison = compare_windows(&week_of_sales(), &[]);
    assert_eq!(comparison.revenue_change_pct, None);
    assert_eq!(comparison.transaction_change_pct, None);
    assert_eq!(comparison.customer_change_pct, None);

    let report = generate_insights(&week_of_sales(), &week_period(), None);
    let json = serde_json::to_value(&report).unwrap();
    let overview = json["overview"].as_object().unwrap();
    assert!(!overview.contains_key("comparison"));

    let compared = generate_insights(&week_of_sales(), &week_period(), Some(&[]));
    let json = serde_json::to_value(&compared).unwrap();
    assert!(json["overview"]["comparison"].is_object());
}

/// Churn block stays internally consistent.
#[test]
fn churn_block_is_consistent() {
    let report = generate_insights(&week_of_sales(), &week_period(), None);
    let churn = &report.churn_analysis;

    let distributed: u64 = churn.churn_distribution.values().sum();
    assert_eq!(distributed, 3);
    assert_eq!(churn.high_risk_customers, 0, "nobody is 35 points deep yet");
    assert_eq!(churn.churn_rate, 0.0);
    assert_eq!(churn.revenue_at_risk, 0.0);

    let clv = &report.clv_projection;
    assert!(clv.total_6m_projection > 0.0);
    assert!((clv.avg_customer_clv * 3.0 - clv.total_6m_projection).abs() < 1e-6);
}

/// The revenue chart series mirrors the daily series.
#[test]
fn revenue_chart_series() {
    let chart = visualization_data("revenue", &week_of_sales()).unwrap();
    assert_eq!(chart["chart_type"], "revenue");
    let labels: Vec<&str> = chart["series"]["labels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(
        labels,
        vec!["2025-06-01", "2025-06-02", "2025-06-03", "2025-06-05", "2025-06-06"]
    );
    assert_eq!(chart["series"]["values"][3], 20_000.0);
}

/// The combined chart bundles all three series.
#[test]
fn combined_chart_carries_all_series() {
    let chart = visualization_data("all", &week_of_sales()).unwrap();
    assert_eq!(chart["chart_type"], "all");
    assert!(chart["revenue"]["labels"].is_array());
    assert!(chart["segmentation"]["labels"].is_array());
    assert!(chart["churn"]["labels"].is_array());

    let segment_counts: u64 = chart["segmentation"]["values"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .sum();
    assert_eq!(segment_counts, 3);
}

/// Unknown chart types are rejected, not silently defaulted.
#[test]
fn unknown_chart_type_is_an_error() {
    let err = visualization_data("pie", &week_of_sales()).unwrap_err();
    assert!(err.to_string().contains("Unknown chart_type 'pie'"), "{err}");
}
