//! The canonical feature schema: column order, derived ratios, validation
//! and scaling.

use chrono::NaiveDateTime;
use jalikoi_analytics::db_utils::{TransactionRecord, STATUS_SUCCESS};
use jalikoi_analytics::feature_utils::{
    build_customer_features, build_transaction_features, customer_feature_row, median_fill,
    validate_features, StandardScaler, ANOMALY_FEATURE_COLUMNS, FEATURE_COLUMNS,
};
use jalikoi_analytics::metrics_utils::CustomerMetrics;

fn sample_metrics() -> CustomerMetrics {
    CustomerMetrics {
        customer_id: "C1".to_string(),
        transaction_count: 8,
        total_spent: 40_000.0,
        avg_transaction: 5_000.0,
        std_transaction: 1_000.0,
        min_transaction: 3_000.0,
        max_transaction: 7_000.0,
        total_liters: 23.5,
        avg_liters: 2.9,
        station_diversity: 3,
        first_transaction: NaiveDateTime::parse_from_str("2025-01-01 08:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
        last_transaction: NaiveDateTime::parse_from_str("2025-05-15 08:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
        payment_method: "1".to_string(),
        app_usage_rate: 0.75,
        failure_rate: 0.1,
        recency_days: 4.0,
        customer_age_days: 134.0,
        frequency: 8.0 / 134.0,
    }
}

/// One row per customer, exactly as wide as the schema says.
#[test]
fn feature_row_matches_schema_width() {
    assert_eq!(FEATURE_COLUMNS.len(), 14);
    let row = customer_feature_row(&sample_metrics());
    assert_eq!(row.len(), FEATURE_COLUMNS.len());

    // Base columns sit in schema order.
    assert_eq!(row[0], 4.0); // recency_days
    assert_eq!(row[2], 8.0); // transaction_count
    assert_eq!(row[3], 40_000.0); // total_spent
    assert_eq!(row[9], 0.75); // app_usage_rate
}

/// The three derived ratios are computed with their smoothing constants.
#[test]
fn derived_ratios_use_smoothing() {
    let m = sample_metrics();
    let row = customer_feature_row(&m);

    let expected_rf = m.recency_days / (m.frequency + 0.1);
    let expected_vc = m.std_transaction / (m.avg_transaction + 1.0);
    let expected_engagement =
        m.transaction_count as f64 * m.app_usage_rate * (1.0 / (m.recency_days + 1.0));

    assert!((row[11] - expected_rf).abs() < 1e-9);
    assert!((row[12] - expected_vc).abs() < 1e-9);
    assert!((row[13] - expected_engagement).abs() < 1e-9);
}

/// Non-finite cells never leave the feature builder.
#[test]
fn feature_row_coerces_non_finite() {
    let mut m = sample_metrics();
    m.avg_transaction = -1.0; // value_consistency would divide by zero
    let row = customer_feature_row(&m);
    assert_eq!(row[12], 0.0);
    assert!(row.iter().all(|v| v.is_finite()));
}

/// Width mismatches name the offending row.
#[test]
fn validate_rejects_ragged_rows() {
    let matrix = vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0]];
    let err = validate_features(&matrix, 3).unwrap_err();
    assert!(err.to_string().contains("row 1"), "{err}");
    assert!(err.to_string().contains("2 columns"), "{err}");
}

/// Non-finite cells name row and column.
#[test]
fn validate_rejects_non_finite_cells() {
    let matrix = vec![vec![1.0, 2.0], vec![1.0, f64::NAN]];
    let err = validate_features(&matrix, 2).unwrap_err();
    assert!(err.to_string().contains("row 1 column 1"), "{err}");

    assert!(validate_features(&[vec![1.0, 2.0]], 2).is_ok());
}

/// Median fill replaces NaN holes with the finite column median.
#[test]
fn median_fill_patches_holes() {
    let mut matrix = vec![
        vec![1.0, f64::NAN],
        vec![3.0, 10.0],
        vec![5.0, 20.0],
        vec![f64::NAN, 30.0],
    ];
    median_fill(&mut matrix);
    assert_eq!(matrix[3][0], 3.0, "median of 1, 3, 5");
    assert_eq!(matrix[0][1], 20.0, "median of 10, 20, 30");

    let mut all_bad = vec![vec![f64::NAN], vec![f64::INFINITY]];
    median_fill(&mut all_bad);
    assert_eq!(all_bad[0][0], 0.0);
    assert_eq!(all_bad[1][0], 0.0);
}

/// Transaction features carry amount, liters, price, hour and weekday.
#[test]
fn transaction_features_encode_time() {
    // 2025-06-02 was a Monday.
    let t = TransactionRecord {
        id: 1,
        station_id: "S1".to_string(),
        motorcyclist_id: "C1".to_string(),
        source: "APP".to_string(),
        fuel_type: "Petrol".to_string(),
        liter: 3.2,
        pump_price: 1_700.0,
        amount: 5_440.0,
        payment_status: STATUS_SUCCESS,
        payment_method_id: "1".to_string(),
        created_at: NaiveDateTime::parse_from_str("2025-06-02 14:30:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
    };
    let matrix = build_transaction_features(&[t]);
    assert_eq!(matrix[0].len(), ANOMALY_FEATURE_COLUMNS.len());
    assert_eq!(matrix[0], vec![5_440.0, 3.2, 1_700.0, 14.0, 0.0]);
}

/// Population standard deviation, zero-variance columns scaled to 1.
#[test]
fn scaler_uses_population_std() {
    let matrix = vec![vec![2.0, 7.0], vec![4.0, 7.0]];
    let scaler = StandardScaler::fit(&matrix).unwrap();
    assert_eq!(scaler.means, vec![3.0, 7.0]);
    assert_eq!(scaler.scales, vec![1.0, 1.0], "population std of [2,4] is 1");

    let scaled = scaler.transform(&matrix).unwrap();
    assert_eq!(scaled[0], vec![-1.0, 0.0]);
    assert_eq!(scaled[1], vec![1.0, 0.0]);
}

/// A transform through the wrong scaler is a schema error, not a skew.
#[test]
fn scaler_rejects_width_mismatch() {
    let scaler = StandardScaler::fit(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
    assert_eq!(scaler.n_features(), 2);
    let err = scaler.transform(&[vec![1.0, 2.0, 3.0]]).unwrap_err();
    assert!(err.to_string().contains("expected 2"), "{err}");
}

/// Fitting on nothing is an error.
#[test]
fn scaler_rejects_empty_matrix() {
    assert!(StandardScaler::fit(&[]).is_err());
}

/// fit_transform centers every column.
#[test]
fn fit_transform_centers_columns() {
    let metrics: Vec<CustomerMetrics> = (0..4)
        .map(|i| {
            let mut m = sample_metrics();
            m.customer_id = format!("C{i}");
            m.recency_days = i as f64 * 3.0;
            m.total_spent = 10_000.0 + i as f64 * 5_000.0;
            m
        })
        .collect();
    let features = build_customer_features(&metrics);
    assert_eq!(features.len(), 4);

    let (_, scaled) = StandardScaler::fit_transform(&features).unwrap();
    for j in 0..FEATURE_COLUMNS.len() {
        let mean: f64 = scaled.iter().map(|r| r[j]).sum::<f64>() / scaled.len() as f64;
        assert!(mean.abs() < 1e-9, "column {j} not centered: {mean}");
    }
}
