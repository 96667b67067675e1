//! End-to-end training over a synthetic fleet, label generation, and the
//! persisted model bundle.

use chrono::NaiveDateTime;
use jalikoi_analytics::db_utils::{TransactionRecord, STATUS_SUCCESS};
use jalikoi_analytics::feature_utils::{build_customer_features, FEATURE_COLUMNS};
use jalikoi_analytics::metrics_utils::{calculate_customer_metrics, CustomerMetrics};
use jalikoi_analytics::ml_utils::{churn_labels, revenue_labels, train_all_models, ModelBundle};
use tempfile::tempdir;

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn txn(id: u64, customer: &str, amount: f64, source: &str, when: &str) -> TransactionRecord {
    TransactionRecord {
        id,
        station_id: format!("S{}", id % 5),
        motorcyclist_id: customer.to_string(),
        source: source.to_string(),
        fuel_type: "Petrol".to_string(),
        liter: amount / 1_700.0,
        pump_price: 1_700.0,
        amount,
        payment_status: STATUS_SUCCESS,
        payment_method_id: "1".to_string(),
        created_at: ts(when),
    }
}

/// 120 customers: 80 still active at the end of June, 40 silent since April.
fn synthetic_fleet() -> Vec<TransactionRecord> {
    let mut transactions = Vec::new();
    let mut next_id = 1u64;
    for i in 0..80u64 {
        let customer = format!("A{i:03}");
        let amount = 3_000.0 + (i % 7) as f64 * 800.0;
        let source = if i % 2 == 0 { "APP" } else { "USSD" };
        let day = 1 + i % 25;
        for (t, month) in ["03", "04", "05"].iter().enumerate() {
            transactions.push(txn(
                next_id,
                &customer,
                amount + t as f64 * 150.0,
                source,
                &format!("2025-{month}-{day:02} 09:30:00"),
            ));
            next_id += 1;
        }
        transactions.push(txn(
            next_id,
            &customer,
            amount + 450.0,
            source,
            &format!("2025-06-{:02} 17:45:00", 25 + i % 6),
        ));
        next_id += 1;
    }
    for j in 0..40u64 {
        let customer = format!("B{j:02}");
        let amount = 2_500.0 + j as f64 * 100.0;
        transactions.push(txn(
            next_id,
            &customer,
            amount,
            "USSD",
            &format!("2025-03-{:02} 11:00:00", 1 + j % 20),
        ));
        next_id += 1;
        transactions.push(txn(
            next_id,
            &customer,
            amount + 200.0,
            "USSD",
            &format!("2025-04-{:02} 12:15:00", 1 + j % 28),
        ));
        next_id += 1;
    }
    transactions
}

fn quiet_metrics(recency: f64) -> CustomerMetrics {
    CustomerMetrics {
        customer_id: "C1".to_string(),
        transaction_count: 10,
        total_spent: 50_000.0,
        avg_transaction: 5_000.0,
        std_transaction: 400.0,
        min_transaction: 4_000.0,
        max_transaction: 6_000.0,
        total_liters: 29.4,
        avg_liters: 2.9,
        station_diversity: 2,
        first_transaction: ts("2025-01-01 08:00:00"),
        last_transaction: ts("2025-05-01 08:00:00"),
        payment_method: "1".to_string(),
        app_usage_rate: 0.5,
        failure_rate: 0.0,
        recency_days: recency,
        customer_age_days: 120.0,
        frequency: 10.0 / 120.0,
    }
}

/// Inactivity beyond 30 days makes a churn label, 30 days exactly does not.
#[test]
fn churn_labels_follow_recency_threshold() {
    let metrics = vec![quiet_metrics(29.0), quiet_metrics(30.0), quiet_metrics(30.1), quiet_metrics(75.0)];
    assert_eq!(churn_labels(&metrics), vec![0, 0, 1, 1]);
}

/// Revenue targets are seeded, non-negative, and zero for zero activity.
#[test]
fn revenue_labels_are_reproducible() {
    let mut idle = quiet_metrics(5.0);
    idle.avg_transaction = 0.0;
    idle.frequency = 0.0;
    let metrics = vec![quiet_metrics(5.0), quiet_metrics(12.0), idle];

    let first = revenue_labels(&metrics, 42);
    let second = revenue_labels(&metrics, 42);
    assert_eq!(first, second, "same seed, same targets");
    assert!(first.iter().all(|v| *v >= 0.0));
    assert_eq!(first[2], 0.0);

    let other_seed = revenue_labels(&metrics, 43);
    assert_ne!(first[0], other_seed[0]);
}

/// Fewer than the minimum cohort refuses to train.
#[test]
fn training_rejects_small_cohorts() {
    let transactions: Vec<TransactionRecord> = (0..99u64)
        .map(|i| {
            txn(
                i + 1,
                &format!("C{i:02}"),
                5_000.0,
                "APP",
                "2025-06-01 10:00:00",
            )
        })
        .collect();
    let err = train_all_models(&transactions).unwrap_err();
    assert!(err.to_string().contains("Need at least 100"), "{err}");
}

/// The full pipeline trains all four models and reports sane numbers.
#[test]
fn training_pipeline_end_to_end() {
    let transactions = synthetic_fleet();
    let outcome = train_all_models(&transactions).unwrap();
    let report = &outcome.report;

    assert_eq!(report.training_customers, 120);
    assert_eq!(report.training_transactions, transactions.len());

    // The churn signal is recency itself, so the holdout should be easy.
    assert!(report.churn.accuracy >= 0.8, "accuracy {}", report.churn.accuracy);
    assert!((0.0..=1.0).contains(&report.churn.cv_accuracy_mean));
    let confusion_total: u64 = report.churn.confusion_matrix.iter().flatten().sum();
    assert_eq!(confusion_total, 24, "80/20 holdout of 120 customers");
    assert_eq!(report.churn.feature_importance.len(), FEATURE_COLUMNS.len());

    assert!(report.revenue.mae >= 0.0);
    assert!(report.revenue.rmse >= report.revenue.mae);
    assert!(report.revenue.r2 <= 1.0);

    assert_eq!(report.segmentation.n_clusters, 8);
    let segmented: u64 = report.segmentation.segment_sizes.iter().map(|(_, n)| n).sum();
    assert_eq!(segmented, 120);

    assert!(report.anomaly.threshold < 0.0);
    assert!((0.0..=0.1).contains(&report.anomaly.training_anomaly_rate));

    let metadata = &outcome.bundle.metadata;
    assert_eq!(metadata.training_samples, 120);
    assert_eq!(metadata.feature_columns, FEATURE_COLUMNS.to_vec());
    assert!((metadata.churn_accuracy - report.churn.accuracy).abs() < 1e-12);
}

/// Saving writes both artifact files and loading restores identical models.
#[test]
fn bundle_save_load_round_trip() {
    let transactions = synthetic_fleet();
    let outcome = train_all_models(&transactions).unwrap();
    let dir = tempdir().unwrap();

    outcome.bundle.save(dir.path()).unwrap();
    assert!(ModelBundle::artifact_path(dir.path()).exists());
    assert!(ModelBundle::metadata_path(dir.path()).exists());

    let metadata_json = std::fs::read_to_string(ModelBundle::metadata_path(dir.path())).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&metadata_json).unwrap();
    assert_eq!(metadata["training_samples"], 120);

    let loaded = ModelBundle::load(dir.path()).unwrap();
    let metrics = calculate_customer_metrics(&transactions);
    let features = build_customer_features(&metrics);

    assert_eq!(
        outcome.bundle.churn.predict_proba(&features).unwrap(),
        loaded.churn.predict_proba(&features).unwrap()
    );
    assert_eq!(
        outcome.bundle.revenue.predict(&features).unwrap(),
        loaded.revenue.predict(&features).unwrap()
    );
    assert_eq!(
        outcome.bundle.segmentation.predict(&features).unwrap(),
        loaded.segmentation.predict(&features).unwrap()
    );
    let anomaly_features =
        jalikoi_analytics::feature_utils::build_transaction_features(&transactions);
    assert_eq!(
        outcome.bundle.anomaly.score_samples(&anomaly_features).unwrap(),
        loaded.anomaly.score_samples(&anomaly_features).unwrap()
    );
}

/// The model-info document exposes every model with its headline numbers.
#[test]
fn model_info_lists_all_models() {
    let transactions = synthetic_fleet();
    let outcome = train_all_models(&transactions).unwrap();
    let info = outcome.bundle.model_info();

    assert_eq!(
        info.pointer("/models/churn/model_type").and_then(|v| v.as_str()),
        Some("RandomForestClassifier")
    );
    assert_eq!(
        info.pointer("/models/revenue/model_type").and_then(|v| v.as_str()),
        Some("GradientBoostingRegressor")
    );
    assert_eq!(
        info.pointer("/models/segmentation/model_type").and_then(|v| v.as_str()),
        Some("KMeans")
    );
    assert_eq!(
        info.pointer("/models/anomaly/model_type").and_then(|v| v.as_str()),
        Some("IsolationForest")
    );
    assert_eq!(
        info.pointer("/metadata/training_samples").and_then(|v| v.as_u64()),
        Some(120)
    );
    assert_eq!(
        info.pointer("/models/segmentation/n_clusters").and_then(|v| v.as_u64()),
        Some(8)
    );
}
