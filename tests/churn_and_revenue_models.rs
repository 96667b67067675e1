//! Churn forest and revenue boosting: fit/predict behavior, score helpers,
//! output constraints.

use chrono::NaiveDateTime;
use jalikoi_analytics::feature_utils::build_customer_features;
use jalikoi_analytics::metrics_utils::CustomerMetrics;
use jalikoi_analytics::ml_utils::{
    apply_revenue_constraints, churn_labels, churn_risk_level, classification_scores,
    regression_scores, revenue_confidence, stratified_split, ChurnModel, ChurnModelParams,
    RevenueModel, RevenueModelParams, REVENUE_ABSOLUTE_CAP,
};

fn metrics_row(customer_id: &str, recency: f64, transaction_count: u64) -> CustomerMetrics {
    let spent = transaction_count as f64 * 5_000.0;
    CustomerMetrics {
        customer_id: customer_id.to_string(),
        transaction_count,
        total_spent: spent,
        avg_transaction: 5_000.0,
        std_transaction: 800.0,
        min_transaction: 3_500.0,
        max_transaction: 6_500.0,
        total_liters: spent / 1_700.0,
        avg_liters: 2.9,
        station_diversity: 2,
        first_transaction: NaiveDateTime::parse_from_str("2025-01-01 08:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
        last_transaction: NaiveDateTime::parse_from_str("2025-06-01 08:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap(),
        payment_method: "1".to_string(),
        app_usage_rate: 0.5,
        failure_rate: 0.05,
        recency_days: recency,
        customer_age_days: 150.0,
        frequency: transaction_count as f64 / 150.0,
    }
}

/// Two well-separated blobs should be trivially learnable.
fn separable_data() -> (Vec<Vec<f64>>, Vec<u32>) {
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for i in 0..30 {
        let jitter = (i % 5) as f64 * 0.1;
        features.push(vec![jitter, 0.5 - jitter]);
        labels.push(0);
        features.push(vec![5.0 + jitter, 5.5 - jitter]);
        labels.push(1);
    }
    (features, labels)
}

/// The forest separates two clean blobs and emits probabilities in [0, 1].
#[test]
fn churn_forest_separates_blobs() {
    let (features, labels) = separable_data();
    let params = ChurnModelParams {
        n_trees: 25,
        max_depth: 6,
        min_samples_split: 4,
        min_samples_leaf: 2,
        seed: 42,
    };
    let model = ChurnModel::fit(&features, &labels, params).unwrap();
    assert_eq!(model.n_trees(), 25);

    let probabilities = model.predict_proba(&features).unwrap();
    assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));

    let predicted = model.predict(&features).unwrap();
    let correct = predicted
        .iter()
        .zip(&labels)
        .filter(|(p, l)| p == l)
        .count();
    assert!(
        correct as f64 / labels.len() as f64 >= 0.9,
        "only {correct} of {} correct",
        labels.len()
    );
}

/// Mismatched feature/label lengths and empty batches are rejected.
#[test]
fn churn_fit_validates_inputs() {
    assert!(ChurnModel::fit(&[vec![1.0]], &[0, 1], ChurnModelParams::default()).is_err());
    assert!(ChurnModel::fit(&[], &[], ChurnModelParams::default()).is_err());
}

/// Per-customer predictions stay aligned with the input batch and keep
/// probability, verdict and risk level consistent.
#[test]
fn churn_predictions_are_consistent() {
    let metrics: Vec<CustomerMetrics> = (0..16)
        .map(|i| {
            let recency = if i % 2 == 0 { 3.0 + i as f64 } else { 45.0 + i as f64 };
            metrics_row(&format!("C{i:02}"), recency, 10 + i as u64)
        })
        .collect();
    let labels = churn_labels(&metrics);
    assert_eq!(labels.iter().filter(|l| **l == 1).count(), 8);

    let params = ChurnModelParams {
        n_trees: 15,
        max_depth: 6,
        min_samples_split: 2,
        min_samples_leaf: 1,
        seed: 42,
    };
    let model = ChurnModel::fit(&build_customer_features(&metrics), &labels, params).unwrap();
    let predictions = model.predict_customers(&metrics).unwrap();

    assert_eq!(predictions.len(), metrics.len());
    for (m, p) in metrics.iter().zip(&predictions) {
        assert_eq!(p.customer_id, m.customer_id);
        assert_eq!(p.churn_prediction, p.churn_probability >= 0.5);
        assert_eq!(p.risk_level, churn_risk_level(p.churn_probability));
    }
}

/// Risk level cutoffs sit at 0.3 and 0.7.
#[test]
fn churn_risk_level_cutoffs() {
    assert_eq!(churn_risk_level(0.0), "Low Risk");
    assert_eq!(churn_risk_level(0.29), "Low Risk");
    assert_eq!(churn_risk_level(0.3), "Medium Risk");
    assert_eq!(churn_risk_level(0.69), "Medium Risk");
    assert_eq!(churn_risk_level(0.7), "High Risk");
    assert_eq!(churn_risk_level(1.0), "High Risk");
}

/// Confusion matrix orientation is [[tn, fp], [fn, tp]].
#[test]
fn classification_scores_by_hand() {
    let (accuracy, precision, recall, f1, cm) =
        classification_scores(&[1, 1, 0, 0], &[1, 0, 0, 1]);
    assert_eq!(cm, [[1, 1], [1, 1]]);
    assert!((accuracy - 0.5).abs() < 1e-9);
    assert!((precision - 0.5).abs() < 1e-9);
    assert!((recall - 0.5).abs() < 1e-9);
    assert!((f1 - 0.5).abs() < 1e-9);
}

/// Regression scores against a hand-computed example.
#[test]
fn regression_scores_by_hand() {
    let report = regression_scores(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]);
    assert!((report.mae - 2.0 / 3.0).abs() < 1e-9);
    assert!((report.rmse - (2.0f64 / 3.0).sqrt()).abs() < 1e-9);
    assert!(report.r2.abs() < 1e-9, "predicting the mean gives r2 = 0");
}

/// Boosting from a constant target never moves off the mean.
#[test]
fn revenue_model_learns_constant() {
    let features: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, (i % 7) as f64]).collect();
    let targets = vec![100.0; 20];
    let params = RevenueModelParams {
        n_estimators: 5,
        learning_rate: 0.1,
        max_depth: 3,
        seed: 42,
    };
    let model = RevenueModel::fit(&features, &targets, params).unwrap();
    for p in model.predict(&features).unwrap() {
        assert!((p - 100.0).abs() < 1e-6, "prediction {p} drifted off the mean");
    }
}

/// A linear signal is fit well on the training data.
#[test]
fn revenue_model_fits_linear_signal() {
    let features: Vec<Vec<f64>> = (0..60)
        .map(|i| vec![i as f64, ((i * 7) % 13) as f64])
        .collect();
    let targets: Vec<f64> = features.iter().map(|row| 100.0 + 5.0 * row[0]).collect();
    let model =
        RevenueModel::fit(&features, &targets, RevenueModelParams::default()).unwrap();
    assert_eq!(model.n_estimators(), 100);

    let predictions = model.predict(&features).unwrap();
    let report = regression_scores(&targets, &predictions);
    assert!(report.r2 > 0.8, "r2 {} too low for a linear signal", report.r2);
}

/// Confidence buckets follow the transaction-count history.
#[test]
fn revenue_confidence_buckets() {
    assert_eq!(revenue_confidence(4), "low");
    assert_eq!(revenue_confidence(5), "medium");
    assert_eq!(revenue_confidence(19), "medium");
    assert_eq!(revenue_confidence(20), "high");
}

/// Forecasts are clamped to realistic bounds; probabilities are untouched by
/// this path.
#[test]
fn revenue_constraints_clamp_forecasts() {
    // Established customer: cap at 2x history.
    let regular = metrics_row("C1", 10.0, 12);
    assert_eq!(apply_revenue_constraints(-5_000.0, &regular), 0.0);
    assert!(
        (apply_revenue_constraints(1e9, &regular) - regular.total_spent * 2.0).abs() < 1e-9
    );

    // Thin history: tighter 1.5x cap.
    let newcomer = metrics_row("C2", 10.0, 3);
    assert!(
        (apply_revenue_constraints(1e9, &newcomer) - newcomer.total_spent * 1.5).abs() < 1e-9
    );

    // Whale: the absolute ceiling binds before the history multiple.
    let mut whale = metrics_row("C3", 10.0, 100);
    whale.total_spent = 40_000_000.0;
    assert!((apply_revenue_constraints(1e9, &whale) - REVENUE_ABSOLUTE_CAP).abs() < 1e-9);

    // Inactivity decay: recency 90 halves the forecast.
    let dormant = metrics_row("C4", 90.0, 12);
    assert!((apply_revenue_constraints(10_000.0, &dormant) - 5_000.0).abs() < 1e-9);

    // Deep inactivity bottoms out at the 10% floor.
    let lost = metrics_row("C5", 200.0, 12);
    assert!((apply_revenue_constraints(10_000.0, &lost) - 1_000.0).abs() < 1e-9);

    // Recent customers are not decayed.
    let active = metrics_row("C6", 30.0, 12);
    assert!((apply_revenue_constraints(10_000.0, &active) - 10_000.0).abs() < 1e-9);
}

/// Forecast rows carry history, horizon scaling and confidence.
#[test]
fn forecast_customers_shapes_output() {
    let metrics: Vec<CustomerMetrics> = (0..12)
        .map(|i| metrics_row(&format!("C{i:02}"), 5.0 + i as f64, 6 + i as u64))
        .collect();
    let features = build_customer_features(&metrics);
    let targets: Vec<f64> = metrics.iter().map(|m| m.total_spent * 0.8).collect();
    let params = RevenueModelParams {
        n_estimators: 10,
        learning_rate: 0.1,
        max_depth: 3,
        seed: 42,
    };
    let model = RevenueModel::fit(&features, &targets, params).unwrap();

    let forecasts = model.forecast_customers(&metrics, 6.0).unwrap();
    assert_eq!(forecasts.len(), metrics.len());
    for (m, f) in metrics.iter().zip(&forecasts) {
        assert_eq!(f.customer_id, m.customer_id);
        assert_eq!(f.historical_revenue, m.total_spent);
        assert_eq!(f.transactions, m.transaction_count);
        assert_eq!(f.confidence, revenue_confidence(m.transaction_count));
        assert!(f.predicted_revenue >= 0.0);
        assert!(f.predicted_revenue <= m.total_spent * 2.0 + 1e-9);
    }

    // A shorter horizon can only shrink a non-negative forecast.
    let quarter = model.forecast_customers(&metrics, 3.0).unwrap();
    for (half, full) in quarter.iter().zip(&forecasts) {
        assert!(half.predicted_revenue <= full.predicted_revenue + 1e-9);
    }
}

/// The stratified split keeps both classes in both partitions at the
/// requested ratio.
#[test]
fn stratified_split_preserves_balance() {
    let mut labels = vec![0u32; 80];
    labels.extend(vec![1u32; 20]);

    let (train, test) = stratified_split(&labels, 0.2, 7);
    assert_eq!(test.len(), 20);
    assert_eq!(train.len(), 80);

    let test_ones = test.iter().filter(|i| labels[**i] == 1).count();
    assert_eq!(test_ones, 4, "20% of the 20 positives");

    let mut all: Vec<usize> = train.iter().chain(test.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..100).collect::<Vec<_>>(), "partitions must cover every row");
}

/// Tiny classes fall back to training rows instead of starving the split.
#[test]
fn stratified_split_keeps_singletons_in_train() {
    let labels = vec![0, 0, 0, 0, 1];
    let (train, test) = stratified_split(&labels, 0.2, 7);
    assert!(train.contains(&4), "the lone positive stays in training");
    assert!(!test.contains(&4));
    assert_eq!(train.len() + test.len(), 5);
}
