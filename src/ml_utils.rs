// ml_utils.rs
use crate::config_utils::AppConfig;
use crate::db_utils::{AnalysisPeriod, DbConnect, TransactionRecord};
use crate::feature_utils::{
    build_customer_features, build_transaction_features, validate_features, StandardScaler,
    ANOMALY_FEATURE_COLUMNS, FEATURE_COLUMNS,
};
use crate::metrics_utils::{calculate_customer_metrics, quantile, CustomerMetrics};
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smartcore::error::Failed;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters, SplitCriterion,
};
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Training refuses to run below this many customers; models fit on less are
/// noise generators.
pub const MIN_TRAINING_CUSTOMERS: usize = 100;

/// Days of inactivity after which a customer counts as churned for labelling.
pub const CHURN_RECENCY_THRESHOLD_DAYS: f64 = 30.0;

/// Hard ceiling on any single 6-month revenue forecast, in RWF.
pub const REVENUE_ABSOLUTE_CAP: f64 = 50_000_000.0;

const ARTIFACT_FILE: &str = "ml_models.bin";
const METADATA_FILE: &str = "metadata.json";

type ChurnTree = DecisionTreeClassifier<f64, u32, DenseMatrix<f64>, Vec<u32>>;
type RevenueTree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

fn to_dense_matrix(rows: &[Vec<f64>]) -> DenseMatrix<f64> {
    let refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
    DenseMatrix::from_2d_array(&refs)
}

/// Standard normal draw via Box-Muller, used for label noise.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

// ---------------------------------------------------------------------------
// Evaluation reports
// ---------------------------------------------------------------------------

/// Holdout + cross-validated quality of the churn classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub cv_accuracy_mean: f64,
    pub cv_accuracy_std: f64,
    /// [[tn, fp], [fn, tp]]
    pub confusion_matrix: [[u64; 2]; 2],
    pub feature_importance: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionReport {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationReport {
    pub inertia: f64,
    pub n_clusters: usize,
    pub segment_sizes: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyTrainingReport {
    pub threshold: f64,
    pub training_anomaly_rate: f64,
}

/// Everything a retrain produces besides the artifact itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub trained_at: String,
    pub training_customers: usize,
    pub training_transactions: usize,
    pub churn: ClassificationReport,
    pub revenue: RegressionReport,
    pub segmentation: SegmentationReport,
    pub anomaly: AnomalyTrainingReport,
}

pub fn classification_scores(y_true: &[u32], y_pred: &[u32]) -> (f64, f64, f64, f64, [[u64; 2]; 2]) {
    let mut tp = 0u64;
    let mut tn = 0u64;
    let mut fp = 0u64;
    let mut fneg = 0u64;
    for (t, p) in y_true.iter().zip(y_pred) {
        match (t, p) {
            (1, 1) => tp += 1,
            (0, 0) => tn += 1,
            (0, 1) => fp += 1,
            _ => fneg += 1,
        }
    }
    let total = y_true.len() as f64;
    let accuracy = if total == 0.0 {
        0.0
    } else {
        (tp + tn) as f64 / total
    };
    let precision = if tp + fp == 0 {
        0.0
    } else {
        tp as f64 / (tp + fp) as f64
    };
    let recall = if tp + fneg == 0 {
        0.0
    } else {
        tp as f64 / (tp + fneg) as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    (accuracy, precision, recall, f1, [[tn, fp], [fneg, tp]])
}

pub fn regression_scores(y_true: &[f64], y_pred: &[f64]) -> RegressionReport {
    let n = y_true.len() as f64;
    if n == 0.0 {
        return RegressionReport {
            mae: 0.0,
            rmse: 0.0,
            r2: 0.0,
        };
    }
    let mae = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .sum::<f64>()
        / n;
    let mse = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / n;
    let mean = y_true.iter().sum::<f64>() / n;
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let r2 = if ss_tot == 0.0 {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    };
    RegressionReport {
        mae,
        rmse: mse.sqrt(),
        r2,
    }
}

// ---------------------------------------------------------------------------
// Churn model: bootstrap forest of decision trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnModelParams {
    pub n_trees: usize,
    pub max_depth: u16,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ChurnModelParams {
    fn default() -> Self {
        ChurnModelParams {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 20,
            min_samples_leaf: 10,
            seed: 42,
        }
    }
}

/// The forest internals, shared between the real model and cross-validation
/// fits. Each tree sees a bootstrap sample of the rows and a random subset of
/// the columns; the vote fraction across trees is the churn probability.
#[derive(Debug, Serialize, Deserialize)]
struct BaggedForest {
    trees: Vec<ChurnTree>,
    feature_subsets: Vec<Vec<usize>>,
    n_trees: usize,
}

impl BaggedForest {
    fn fit(
        scaled: &[Vec<f64>],
        labels: &[u32],
        params: &ChurnModelParams,
    ) -> Result<Self, Failed> {
        let n_rows = scaled.len();
        let width = scaled[0].len();
        let subset_size = (width as f64).sqrt().ceil() as usize;
        let subset_size = subset_size.clamp(1, width);

        let fits: Result<Vec<(ChurnTree, Vec<usize>)>, Failed> = (0..params.n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(tree_idx as u64));

                let mut subset: Vec<usize> =
                    rand::seq::index::sample(&mut rng, width, subset_size).into_vec();
                subset.sort_unstable();

                let mut rows = Vec::with_capacity(n_rows);
                let mut y = Vec::with_capacity(n_rows);
                for _ in 0..n_rows {
                    let pick = rng.gen_range(0..n_rows);
                    rows.push(
                        subset
                            .iter()
                            .map(|&c| scaled[pick][c])
                            .collect::<Vec<f64>>(),
                    );
                    y.push(labels[pick]);
                }

                let x = to_dense_matrix(&rows);
                let tree = DecisionTreeClassifier::fit(
                    &x,
                    &y,
                    DecisionTreeClassifierParameters {
                        criterion: SplitCriterion::Gini,
                        max_depth: Some(params.max_depth),
                        min_samples_leaf: params.min_samples_leaf,
                        min_samples_split: params.min_samples_split,
                        seed: Option::None,
                    },
                )?;
                Ok((tree, subset))
            })
            .collect();

        let mut trees = Vec::with_capacity(params.n_trees);
        let mut feature_subsets = Vec::with_capacity(params.n_trees);
        for (tree, subset) in fits? {
            trees.push(tree);
            feature_subsets.push(subset);
        }
        Ok(BaggedForest {
            trees,
            feature_subsets,
            n_trees: params.n_trees,
        })
    }

    fn vote_fraction(&self, scaled: &[Vec<f64>]) -> Result<Vec<f64>, Failed> {
        let mut votes = vec![0.0f64; scaled.len()];
        for (tree, subset) in self.trees.iter().zip(&self.feature_subsets) {
            let rows: Vec<Vec<f64>> = scaled
                .iter()
                .map(|row| subset.iter().map(|&c| row[c]).collect())
                .collect();
            let x = to_dense_matrix(&rows);
            for (i, label) in tree.predict(&x)?.into_iter().enumerate() {
                if label == 1 {
                    votes[i] += 1.0;
                }
            }
        }
        Ok(votes
            .into_iter()
            .map(|v| (v / self.n_trees as f64).clamp(0.0, 1.0))
            .collect())
    }
}

/// One customer's churn verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ChurnPrediction {
    pub customer_id: String,
    pub churn_probability: f64,
    pub churn_prediction: bool,
    pub risk_level: String,
}

pub fn churn_risk_level(probability: f64) -> &'static str {
    if probability < 0.3 {
        "Low Risk"
    } else if probability < 0.7 {
        "Medium Risk"
    } else {
        "High Risk"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChurnModel {
    forest: BaggedForest,
    scaler: StandardScaler,
    params: ChurnModelParams,
}

impl ChurnModel {
    /// Fits the scaler and forest on raw (unscaled) training features.
    pub fn fit(
        features: &[Vec<f64>],
        labels: &[u32],
        params: ChurnModelParams,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if features.len() != labels.len() {
            return Err("Feature and label counts differ".into());
        }
        if features.is_empty() {
            return Err("Cannot fit the churn model on an empty matrix".into());
        }
        let (scaler, scaled) = StandardScaler::fit_transform(features)?;
        let forest = BaggedForest::fit(&scaled, labels, &params)?;
        Ok(ChurnModel {
            forest,
            scaler,
            params,
        })
    }

    /// Vote-fraction churn probabilities, clamped to [0, 1].
    pub fn predict_proba(
        &self,
        features: &[Vec<f64>],
    ) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
        let scaled = self.scaler.transform(features)?;
        Ok(self.forest.vote_fraction(&scaled)?)
    }

    pub fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
        Ok(self
            .predict_proba(features)?
            .into_iter()
            .map(|p| if p >= 0.5 { 1 } else { 0 })
            .collect())
    }

    /// Full per-customer churn assessment for an inference batch.
    pub fn predict_customers(
        &self,
        metrics: &[CustomerMetrics],
    ) -> Result<Vec<ChurnPrediction>, Box<dyn std::error::Error>> {
        let features = build_customer_features(metrics);
        validate_features(&features, FEATURE_COLUMNS.len())?;
        let probabilities = self.predict_proba(&features)?;
        Ok(metrics
            .iter()
            .zip(probabilities)
            .map(|(m, p)| ChurnPrediction {
                customer_id: m.customer_id.clone(),
                churn_probability: p,
                churn_prediction: p >= 0.5,
                risk_level: churn_risk_level(p).to_string(),
            })
            .collect())
    }

    pub fn n_trees(&self) -> usize {
        self.params.n_trees
    }
}

// ---------------------------------------------------------------------------
// Revenue model: gradient boosted regression trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueModelParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: u16,
    pub seed: u64,
}

impl Default for RevenueModelParams {
    fn default() -> Self {
        RevenueModelParams {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 5,
            seed: 42,
        }
    }
}

/// Projected revenue for one customer over a forecast horizon, already passed
/// through the realism constraints.
#[derive(Debug, Clone, Serialize)]
pub struct RevenueForecast {
    pub customer_id: String,
    pub predicted_revenue: f64,
    pub historical_revenue: f64,
    pub transactions: u64,
    pub confidence: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevenueModel {
    init_prediction: f64,
    trees: Vec<RevenueTree>,
    scaler: StandardScaler,
    params: RevenueModelParams,
}

impl RevenueModel {
    /// Standard least-squares boosting: start from the training mean, fit each
    /// tree on the residuals of the running prediction.
    pub fn fit(
        features: &[Vec<f64>],
        targets: &[f64],
        params: RevenueModelParams,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if features.len() != targets.len() {
            return Err("Feature and target counts differ".into());
        }
        if features.is_empty() {
            return Err("Cannot fit the revenue model on an empty matrix".into());
        }
        let (scaler, scaled) = StandardScaler::fit_transform(features)?;
        let x = to_dense_matrix(&scaled);

        let init_prediction = targets.iter().sum::<f64>() / targets.len() as f64;
        let mut running: Vec<f64> = vec![init_prediction; targets.len()];
        let mut trees: Vec<RevenueTree> = Vec::with_capacity(params.n_estimators);

        for _ in 0..params.n_estimators {
            let residuals: Vec<f64> = targets
                .iter()
                .zip(&running)
                .map(|(t, p)| t - p)
                .collect();
            let tree = DecisionTreeRegressor::fit(
                &x,
                &residuals,
                DecisionTreeRegressorParameters::default()
                    .with_max_depth(params.max_depth)
                    .with_min_samples_leaf(1)
                    .with_min_samples_split(2),
            )?;
            let step = tree.predict(&x)?;
            for (r, s) in running.iter_mut().zip(step) {
                *r += params.learning_rate * s;
            }
            trees.push(tree);
        }

        Ok(RevenueModel {
            init_prediction,
            trees,
            scaler,
            params,
        })
    }

    /// Raw 6-month revenue predictions, unconstrained.
    pub fn predict(
        &self,
        features: &[Vec<f64>],
    ) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
        let scaled = self.scaler.transform(features)?;
        let x = to_dense_matrix(&scaled);
        let mut predictions = vec![self.init_prediction; features.len()];
        for tree in &self.trees {
            let step = tree.predict(&x)?;
            for (p, s) in predictions.iter_mut().zip(step) {
                *p += self.params.learning_rate * s;
            }
        }
        Ok(predictions)
    }

    /// Per-customer forecasts for an arbitrary horizon (the model is trained
    /// on a 6-month target and scaled linearly), constrained to be realistic.
    pub fn forecast_customers(
        &self,
        metrics: &[CustomerMetrics],
        months: f64,
    ) -> Result<Vec<RevenueForecast>, Box<dyn std::error::Error>> {
        let features = build_customer_features(metrics);
        validate_features(&features, FEATURE_COLUMNS.len())?;
        let raw = self.predict(&features)?;
        Ok(metrics
            .iter()
            .zip(raw)
            .map(|(m, p)| {
                let horizon = p * (months / 6.0);
                RevenueForecast {
                    customer_id: m.customer_id.clone(),
                    predicted_revenue: apply_revenue_constraints(horizon, m),
                    historical_revenue: m.total_spent,
                    transactions: m.transaction_count,
                    confidence: revenue_confidence(m.transaction_count).to_string(),
                }
            })
            .collect())
    }

    pub fn n_estimators(&self) -> usize {
        self.params.n_estimators
    }
}

pub fn revenue_confidence(transaction_count: u64) -> &'static str {
    if transaction_count >= 20 {
        "high"
    } else if transaction_count >= 5 {
        "medium"
    } else {
        "low"
    }
}

/// Realism constraints on a single revenue forecast (churn probabilities are
/// never constrained this way):
/// never negative, at most 2x the customer's historical spend (1.5x for
/// customers with fewer than 5 transactions), an absolute RWF ceiling, and a
/// decay for customers inactive for more than 30 days.
pub fn apply_revenue_constraints(prediction: f64, m: &CustomerMetrics) -> f64 {
    let mut p = prediction.max(0.0);
    let history_multiplier = if m.transaction_count < 5 { 1.5 } else { 2.0 };
    p = p.min(m.total_spent * history_multiplier);
    p = p.min(REVENUE_ABSOLUTE_CAP);
    if m.recency_days > 30.0 {
        p *= (1.0 - m.recency_days / 180.0).max(0.1);
    }
    p
}

// ---------------------------------------------------------------------------
// Segmentation model: k-means with business segment names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationParams {
    pub n_clusters: usize,
    pub n_init: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        SegmentationParams {
            n_clusters: 8,
            n_init: 10,
            max_iter: 300,
            seed: 42,
        }
    }
}

/// Cluster index to business segment name, the platform's canonical map.
pub fn segment_name(cluster: usize) -> String {
    match cluster {
        0 => "Lost Customers".to_string(),
        1 => "Dormant".to_string(),
        2 => "Premium VIPs".to_string(),
        3 => "At Risk".to_string(),
        4 => "Occasional Users".to_string(),
        5 => "Loyal Regulars".to_string(),
        6 => "Growth Potential".to_string(),
        7 => "New Customers".to_string(),
        other => format!("Segment {}", other),
    }
}

/// A young account with real activity belongs in `New Customers` no matter
/// which cluster the centroids put it in: under 90 days old, still active in
/// the last 30, and showing spend or frequency beyond a one-off trial.
pub fn is_emerging_customer(m: &CustomerMetrics) -> bool {
    let has_potential = m.frequency > 0.5 || m.total_spent > 100_000.0 || m.transaction_count > 5;
    m.customer_age_days < 90.0 && has_potential && m.recency_days < 30.0
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentAssignment {
    pub customer_id: String,
    pub cluster: usize,
    pub segment_name: String,
}

/// Aggregate profile of one business segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentStat {
    pub segment_name: String,
    pub customer_count: u64,
    pub total_revenue: f64,
    pub avg_revenue_per_customer: f64,
    pub avg_transactions: f64,
    pub avg_recency_days: f64,
    pub avg_frequency: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentationModel {
    centroids: Vec<Vec<f64>>,
    pub inertia: f64,
    scaler: StandardScaler,
    params: SegmentationParams,
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest_centroid(row: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(row, c);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    (best, best_dist)
}

/// One Lloyd's run from a k-means++ seeding. Returns (centroids, inertia).
fn kmeans_single_run(
    scaled: &[Vec<f64>],
    k: usize,
    max_iter: usize,
    rng: &mut StdRng,
) -> (Vec<Vec<f64>>, f64) {
    let n = scaled.len();
    let width = scaled[0].len();

    // k-means++ seeding
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(scaled[rng.gen_range(0..n)].clone());
    while centroids.len() < k {
        let distances: Vec<f64> = scaled
            .iter()
            .map(|row| nearest_centroid(row, &centroids).1)
            .collect();
        let total: f64 = distances.iter().sum();
        if total == 0.0 {
            centroids.push(scaled[rng.gen_range(0..n)].clone());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = n - 1;
        for (i, d) in distances.iter().enumerate() {
            if target < *d {
                chosen = i;
                break;
            }
            target -= d;
        }
        centroids.push(scaled[chosen].clone());
    }

    let mut assignments = vec![0usize; n];
    for _ in 0..max_iter {
        let mut changed = false;
        for (i, row) in scaled.iter().enumerate() {
            let (c, _) = nearest_centroid(row, &centroids);
            if assignments[i] != c {
                assignments[i] = c;
                changed = true;
            }
        }

        let mut sums = vec![vec![0.0; width]; k];
        let mut counts = vec![0usize; k];
        for (row, &c) in scaled.iter().zip(&assignments) {
            counts[c] += 1;
            for (j, v) in row.iter().enumerate() {
                sums[c][j] += v;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed an empty cluster on the farthest point
                let far = scaled
                    .iter()
                    .enumerate()
                    .map(|(i, row)| (i, nearest_centroid(row, &centroids).1))
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centroids[c] = scaled[far].clone();
                continue;
            }
            for j in 0..width {
                centroids[c][j] = sums[c][j] / counts[c] as f64;
            }
        }

        if !changed {
            break;
        }
    }

    let inertia: f64 = scaled
        .iter()
        .map(|row| nearest_centroid(row, &centroids).1)
        .sum();
    (centroids, inertia)
}

impl SegmentationModel {
    /// Fits k-means over the scaled customer features, keeping the best of
    /// `n_init` seeded restarts by inertia.
    pub fn fit(
        features: &[Vec<f64>],
        params: SegmentationParams,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if features.len() < params.n_clusters {
            return Err(format!(
                "Need at least {} customers to segment, found {}",
                params.n_clusters,
                features.len()
            )
            .into());
        }
        let (scaler, scaled) = StandardScaler::fit_transform(features)?;

        let runs: Vec<(Vec<Vec<f64>>, f64)> = (0..params.n_init)
            .into_par_iter()
            .map(|run| {
                let mut rng =
                    StdRng::seed_from_u64(params.seed.wrapping_add(run as u64));
                kmeans_single_run(&scaled, params.n_clusters, params.max_iter, &mut rng)
            })
            .collect();

        let (centroids, inertia) = runs
            .into_iter()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or("KMeans produced no runs")?;

        Ok(SegmentationModel {
            centroids,
            inertia,
            scaler,
            params,
        })
    }

    pub fn predict(
        &self,
        features: &[Vec<f64>],
    ) -> Result<Vec<usize>, Box<dyn std::error::Error>> {
        let scaled = self.scaler.transform(features)?;
        Ok(scaled
            .iter()
            .map(|row| nearest_centroid(row, &self.centroids).0)
            .collect())
    }

    /// Cluster assignment plus the business-rule overlay: fresh customers with
    /// real activity are always `New Customers`, and customers stuck with that
    /// label past 90 days of age get reclassified as `Occasional Users`.
    pub fn assign_customers(
        &self,
        metrics: &[CustomerMetrics],
    ) -> Result<Vec<SegmentAssignment>, Box<dyn std::error::Error>> {
        let features = build_customer_features(metrics);
        validate_features(&features, FEATURE_COLUMNS.len())?;
        let clusters = self.predict(&features)?;
        Ok(metrics
            .iter()
            .zip(clusters)
            .map(|(m, cluster)| {
                let mut name = segment_name(cluster);
                if is_emerging_customer(m) {
                    name = "New Customers".to_string();
                } else if name == "New Customers" && m.customer_age_days >= 90.0 {
                    name = "Occasional Users".to_string();
                }
                SegmentAssignment {
                    customer_id: m.customer_id.clone(),
                    cluster,
                    segment_name: name,
                }
            })
            .collect())
    }

    pub fn n_clusters(&self) -> usize {
        self.params.n_clusters
    }
}

/// Per-segment aggregates for the segments endpoint, ordered by revenue.
pub fn segment_statistics(
    assignments: &[SegmentAssignment],
    metrics: &[CustomerMetrics],
) -> Vec<SegmentStat> {
    let mut grouped: HashMap<&str, Vec<&CustomerMetrics>> = HashMap::new();
    for (a, m) in assignments.iter().zip(metrics) {
        grouped.entry(a.segment_name.as_str()).or_default().push(m);
    }

    let mut stats: Vec<SegmentStat> = grouped
        .into_iter()
        .map(|(name, members)| {
            let count = members.len() as f64;
            let total_revenue: f64 = members.iter().map(|m| m.total_spent).sum();
            SegmentStat {
                segment_name: name.to_string(),
                customer_count: members.len() as u64,
                total_revenue,
                avg_revenue_per_customer: total_revenue / count,
                avg_transactions: members
                    .iter()
                    .map(|m| m.transaction_count as f64)
                    .sum::<f64>()
                    / count,
                avg_recency_days: members.iter().map(|m| m.recency_days).sum::<f64>() / count,
                avg_frequency: members.iter().map(|m| m.frequency).sum::<f64>() / count,
            }
        })
        .collect();
    stats.sort_by(|a, b| {
        b.total_revenue
            .partial_cmp(&a.total_revenue)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    stats
}

// ---------------------------------------------------------------------------
// Anomaly model: isolation forest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModelParams {
    pub n_trees: usize,
    pub subsample: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for AnomalyModelParams {
    fn default() -> Self {
        AnomalyModelParams {
            n_trees: 100,
            subsample: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsoNode {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
    Leaf {
        size: usize,
    },
}

/// Expected unsuccessful-search path length in a binary search tree of n
/// nodes, the normalisation constant from the isolation forest paper.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let nf = n as f64;
            2.0 * ((nf - 1.0).ln() + 0.577_215_664_9) - 2.0 * (nf - 1.0) / nf
        }
    }
}

fn build_iso_tree(
    scaled: &[Vec<f64>],
    indices: &[usize],
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> IsoNode {
    if depth >= height_limit || indices.len() <= 1 {
        return IsoNode::Leaf {
            size: indices.len(),
        };
    }
    let width = scaled[0].len();
    let feature = rng.gen_range(0..width);
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &i in indices {
        let v = scaled[i][feature];
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if lo >= hi {
        return IsoNode::Leaf {
            size: indices.len(),
        };
    }
    let threshold = rng.gen_range(lo..hi);
    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .partition(|&&i| scaled[i][feature] < threshold);
    if left_idx.is_empty() || right_idx.is_empty() {
        return IsoNode::Leaf {
            size: indices.len(),
        };
    }
    IsoNode::Split {
        feature,
        threshold,
        left: Box::new(build_iso_tree(
            scaled,
            &left_idx,
            depth + 1,
            height_limit,
            rng,
        )),
        right: Box::new(build_iso_tree(
            scaled,
            &right_idx,
            depth + 1,
            height_limit,
            rng,
        )),
    }
}

fn iso_path_length(node: &IsoNode, row: &[f64], depth: usize) -> f64 {
    match node {
        IsoNode::Leaf { size } => depth as f64 + average_path_length(*size),
        IsoNode::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if row[*feature] < *threshold {
                iso_path_length(left, row, depth + 1)
            } else {
                iso_path_length(right, row, depth + 1)
            }
        }
    }
}

/// One flagged (or cleared) transaction.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFlag {
    pub transaction_id: u64,
    pub customer_id: String,
    pub amount: f64,
    pub liters: f64,
    pub station_id: String,
    pub timestamp: String,
    pub anomaly_score: f64,
    pub risk_level: String,
    pub payment_status: i32,
    pub is_anomaly: bool,
}

pub fn anomaly_risk_level(score: f64) -> &'static str {
    if score <= -0.5 {
        "High Risk"
    } else if score <= -0.2 {
        "Medium Risk"
    } else {
        "Normal"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnomalyModel {
    trees: Vec<IsoNode>,
    subsample: usize,
    pub threshold: f64,
    scaler: StandardScaler,
    params: AnomalyModelParams,
}

impl AnomalyModel {
    /// Fits the forest on per-transaction features and records the
    /// contamination-quantile score threshold for later verdicts.
    pub fn fit(
        features: &[Vec<f64>],
        params: AnomalyModelParams,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if features.is_empty() {
            return Err("Cannot fit the anomaly model on an empty matrix".into());
        }
        let (scaler, scaled) = StandardScaler::fit_transform(features)?;

        let psi = params.subsample.min(scaled.len()).max(2);
        let height_limit = (psi as f64).log2().ceil() as usize;

        let trees: Vec<IsoNode> = (0..params.n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(tree_idx as u64));
                let mut indices: Vec<usize> = (0..scaled.len()).collect();
                indices.shuffle(&mut rng);
                indices.truncate(psi);
                build_iso_tree(&scaled, &indices, 0, height_limit, &mut rng)
            })
            .collect();

        let mut model = AnomalyModel {
            trees,
            subsample: psi,
            threshold: 0.0,
            scaler,
            params: params.clone(),
        };

        let mut training_scores = model.score_scaled(&scaled);
        training_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        model.threshold = quantile(&training_scores, params.contamination);
        Ok(model)
    }

    fn score_scaled(&self, scaled: &[Vec<f64>]) -> Vec<f64> {
        let c = average_path_length(self.subsample);
        scaled
            .par_iter()
            .map(|row| {
                let mean_path: f64 = self
                    .trees
                    .iter()
                    .map(|t| iso_path_length(t, row, 0))
                    .sum::<f64>()
                    / self.trees.len() as f64;
                -(2.0_f64.powf(-mean_path / c))
            })
            .collect()
    }

    /// Anomaly scores in (-1, 0); the lower the score the more isolated the
    /// point.
    pub fn score_samples(
        &self,
        features: &[Vec<f64>],
    ) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
        let scaled = self.scaler.transform(features)?;
        Ok(self.score_scaled(&scaled))
    }

    /// Scores a transaction batch and returns flags sorted most-anomalous
    /// first.
    pub fn detect(
        &self,
        transactions: &[TransactionRecord],
    ) -> Result<Vec<AnomalyFlag>, Box<dyn std::error::Error>> {
        let features = build_transaction_features(transactions);
        validate_features(&features, ANOMALY_FEATURE_COLUMNS.len())?;
        let scores = self.score_samples(&features)?;
        let mut flags: Vec<AnomalyFlag> = transactions
            .iter()
            .zip(scores)
            .map(|(t, score)| AnomalyFlag {
                transaction_id: t.id,
                customer_id: t.motorcyclist_id.clone(),
                amount: t.amount,
                liters: t.liter,
                station_id: t.station_id.clone(),
                timestamp: t.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                anomaly_score: score,
                risk_level: anomaly_risk_level(score).to_string(),
                payment_status: t.payment_status,
                is_anomaly: score < self.threshold,
            })
            .collect();
        flags.sort_by(|a, b| {
            a.anomaly_score
                .partial_cmp(&b.anomaly_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(flags)
    }

    pub fn n_trees(&self) -> usize {
        self.params.n_trees
    }
}

// ---------------------------------------------------------------------------
// Training pipeline and the persisted bundle
// ---------------------------------------------------------------------------

/// Churn label: inactive past the threshold.
pub fn churn_labels(metrics: &[CustomerMetrics]) -> Vec<u32> {
    metrics
        .iter()
        .map(|m| {
            if m.recency_days > CHURN_RECENCY_THRESHOLD_DAYS {
                1
            } else {
                0
            }
        })
        .collect()
}

/// 6-month revenue target: run-rate extrapolation with seeded ~10% noise so
/// the regressor learns a distribution rather than an identity.
pub fn revenue_labels(metrics: &[CustomerMetrics], seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    metrics
        .iter()
        .map(|m| {
            let base = m.avg_transaction * m.frequency * 180.0;
            (base * (1.0 + 0.1 * gaussian(&mut rng))).max(0.0)
        })
        .collect()
}

/// 80/20 split preserving class balance, shuffled deterministically.
pub fn stratified_split(
    labels: &[u32],
    test_fraction: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: HashMap<u32, Vec<usize>> = HashMap::new();
    for (i, l) in labels.iter().enumerate() {
        by_class.entry(*l).or_default().push(i);
    }
    let mut classes: Vec<u32> = by_class.keys().copied().collect();
    classes.sort_unstable();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in classes {
        let mut indices = by_class.remove(&class).unwrap_or_default();
        indices.shuffle(&mut rng);
        if indices.len() < 2 {
            train.extend(indices);
            continue;
        }
        let n_test = ((indices.len() as f64 * test_fraction).round() as usize)
            .clamp(1, indices.len() - 1);
        test.extend(indices.drain(..n_test));
        train.extend(indices);
    }
    (train, test)
}

fn select_rows<T: Clone>(rows: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| rows[i].clone()).collect()
}

/// Mean/std of 5-fold accuracy, refitting the forest (and a fold-local
/// scaler) from scratch on each fold.
fn cross_validate_churn(
    features: &[Vec<f64>],
    labels: &[u32],
    params: &ChurnModelParams,
    folds: usize,
) -> Result<(f64, f64), Box<dyn std::error::Error>> {
    let mut indices: Vec<usize> = (0..features.len()).collect();
    let mut rng = StdRng::seed_from_u64(params.seed);
    indices.shuffle(&mut rng);

    let mut accuracies = Vec::with_capacity(folds);
    for fold in 0..folds {
        let test_idx: Vec<usize> = indices
            .iter()
            .skip(fold)
            .step_by(folds)
            .copied()
            .collect();
        let train_idx: Vec<usize> = indices
            .iter()
            .filter(|i| !test_idx.contains(i))
            .copied()
            .collect();
        if train_idx.is_empty() || test_idx.is_empty() {
            continue;
        }

        let model = ChurnModel::fit(
            &select_rows(features, &train_idx),
            &select_rows(labels, &train_idx),
            params.clone(),
        )?;
        let predicted = model.predict(&select_rows(features, &test_idx))?;
        let truth = select_rows(labels, &test_idx);
        let (accuracy, _, _, _, _) = classification_scores(&truth, &predicted);
        accuracies.push(accuracy);
    }

    let n = accuracies.len() as f64;
    if n == 0.0 {
        return Ok((0.0, 0.0));
    }
    let mean = accuracies.iter().sum::<f64>() / n;
    let var = accuracies.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    Ok((mean, var.sqrt()))
}

/// Model-agnostic permutation importance on the holdout: accuracy drop when a
/// column is shuffled.
fn permutation_importance(
    model: &ChurnModel,
    features: &[Vec<f64>],
    labels: &[u32],
    seed: u64,
) -> Result<Vec<(String, f64)>, Box<dyn std::error::Error>> {
    let baseline_pred = model.predict(features)?;
    let (baseline, _, _, _, _) = classification_scores(labels, &baseline_pred);

    let width = features.first().map(|r| r.len()).unwrap_or(0);
    let mut importances = Vec::with_capacity(width);
    let mut rng = StdRng::seed_from_u64(seed);
    for col in 0..width {
        let mut shuffled: Vec<Vec<f64>> = features.to_vec();
        let mut column: Vec<f64> = shuffled.iter().map(|r| r[col]).collect();
        column.shuffle(&mut rng);
        for (row, v) in shuffled.iter_mut().zip(column) {
            row[col] = v;
        }
        let predicted = model.predict(&shuffled)?;
        let (accuracy, _, _, _, _) = classification_scores(labels, &predicted);
        let name = FEATURE_COLUMNS
            .get(col)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("feature_{}", col));
        importances.push((name, baseline - accuracy));
    }
    importances.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(importances)
}

/// Metadata persisted next to the artifact, also served by the model-info
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_version: String,
    pub last_trained: String,
    pub training_samples: usize,
    pub churn_accuracy: f64,
    pub revenue_mae: f64,
    pub feature_columns: Vec<String>,
}

/// The four fitted models plus metadata, saved and loaded as one unit.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelBundle {
    pub churn: ChurnModel,
    pub revenue: RevenueModel,
    pub segmentation: SegmentationModel,
    pub anomaly: AnomalyModel,
    pub metadata: ModelMetadata,
}

impl ModelBundle {
    pub fn artifact_path(dir: &Path) -> PathBuf {
        dir.join(ARTIFACT_FILE)
    }

    pub fn metadata_path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE)
    }

    /// Writes the MessagePack artifact and the human-readable metadata JSON.
    pub fn save(&self, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::create_dir_all(dir)?;
        let bytes = rmp_serde::to_vec(self)?;
        std::fs::write(Self::artifact_path(dir), bytes)?;
        std::fs::write(
            Self::metadata_path(dir),
            serde_json::to_string_pretty(&self.metadata)?,
        )?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = std::fs::read(Self::artifact_path(dir))?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Per-model summary for the model-info endpoint.
    pub fn model_info(&self) -> Value {
        json!({
            "models": {
                "churn": {
                    "model_type": "RandomForestClassifier",
                    "n_trees": self.churn.n_trees(),
                    "accuracy": self.metadata.churn_accuracy,
                },
                "revenue": {
                    "model_type": "GradientBoostingRegressor",
                    "n_estimators": self.revenue.n_estimators(),
                    "mae": self.metadata.revenue_mae,
                },
                "segmentation": {
                    "model_type": "KMeans",
                    "n_clusters": self.segmentation.n_clusters(),
                    "inertia": self.segmentation.inertia,
                },
                "anomaly": {
                    "model_type": "IsolationForest",
                    "n_trees": self.anomaly.n_trees(),
                    "score_threshold": self.anomaly.threshold,
                },
            },
            "metadata": {
                "model_version": self.metadata.model_version,
                "last_trained": self.metadata.last_trained,
                "training_samples": self.metadata.training_samples,
                "feature_columns": self.metadata.feature_columns,
            },
        })
    }
}

/// A finished training run: the bundle ready to serve plus its report.
#[derive(Debug)]
pub struct TrainingOutcome {
    pub bundle: ModelBundle,
    pub report: TrainingReport,
}

/// Trains all four models from a raw transaction window.
///
/// Order matters only for reporting; the models are independent. Refuses to
/// run on fewer than [`MIN_TRAINING_CUSTOMERS`] customers.
pub fn train_all_models(
    transactions: &[TransactionRecord],
) -> Result<TrainingOutcome, Box<dyn std::error::Error>> {
    let metrics = calculate_customer_metrics(transactions);
    if metrics.len() < MIN_TRAINING_CUSTOMERS {
        return Err(format!(
            "Need at least {} customers with successful transactions to train, found {}",
            MIN_TRAINING_CUSTOMERS,
            metrics.len()
        )
        .into());
    }

    let features = build_customer_features(&metrics);
    validate_features(&features, FEATURE_COLUMNS.len())?;

    // Churn: stratified 80/20, holdout metrics, cross-validation
    let churn_params = ChurnModelParams::default();
    let labels = churn_labels(&metrics);
    let (train_idx, test_idx) = stratified_split(&labels, 0.2, churn_params.seed);
    let churn_model = ChurnModel::fit(
        &select_rows(&features, &train_idx),
        &select_rows(&labels, &train_idx),
        churn_params.clone(),
    )?;
    let test_features = select_rows(&features, &test_idx);
    let test_labels = select_rows(&labels, &test_idx);
    let predicted = churn_model.predict(&test_features)?;
    let (accuracy, precision, recall, f1, confusion_matrix) =
        classification_scores(&test_labels, &predicted);
    let (cv_mean, cv_std) = cross_validate_churn(&features, &labels, &churn_params, 5)?;
    let feature_importance =
        permutation_importance(&churn_model, &test_features, &test_labels, churn_params.seed)?;
    let churn_report = ClassificationReport {
        accuracy,
        precision,
        recall,
        f1,
        cv_accuracy_mean: cv_mean,
        cv_accuracy_std: cv_std,
        confusion_matrix,
        feature_importance,
    };
    log::info!(
        "Churn model trained: accuracy {:.3}, cv {:.3} +/- {:.3}",
        accuracy,
        cv_mean,
        cv_std
    );

    // Revenue: plain 80/20 on the noisy run-rate target
    let revenue_params = RevenueModelParams::default();
    let targets = revenue_labels(&metrics, revenue_params.seed);
    let mut indices: Vec<usize> = (0..features.len()).collect();
    let mut rng = StdRng::seed_from_u64(revenue_params.seed);
    indices.shuffle(&mut rng);
    let n_test = ((features.len() as f64) * 0.2).round() as usize;
    let n_test = n_test.clamp(1, features.len() - 1);
    let (rev_test_idx, rev_train_idx) = indices.split_at(n_test);
    let revenue_model = RevenueModel::fit(
        &select_rows(&features, rev_train_idx),
        &select_rows(&targets, rev_train_idx),
        revenue_params,
    )?;
    let rev_predicted = revenue_model.predict(&select_rows(&features, rev_test_idx))?;
    let revenue_report =
        regression_scores(&select_rows(&targets, rev_test_idx), &rev_predicted);
    log::info!(
        "Revenue model trained: MAE {:.0} RWF, R2 {:.3}",
        revenue_report.mae,
        revenue_report.r2
    );

    // Segmentation on the full customer base
    let segmentation_model = SegmentationModel::fit(&features, SegmentationParams::default())?;
    let assignments = segmentation_model.assign_customers(&metrics)?;
    let mut segment_sizes: HashMap<String, u64> = HashMap::new();
    for a in &assignments {
        *segment_sizes.entry(a.segment_name.clone()).or_insert(0) += 1;
    }
    let mut segment_sizes: Vec<(String, u64)> = segment_sizes.into_iter().collect();
    segment_sizes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let segmentation_report = SegmentationReport {
        inertia: segmentation_model.inertia,
        n_clusters: segmentation_model.n_clusters(),
        segment_sizes,
    };
    log::info!(
        "Segmentation model trained: inertia {:.1} over {} clusters",
        segmentation_model.inertia,
        segmentation_model.n_clusters()
    );

    // Anomaly detection on the raw transaction stream
    let anomaly_features = build_transaction_features(transactions);
    let anomaly_model = AnomalyModel::fit(&anomaly_features, AnomalyModelParams::default())?;
    let training_scores = anomaly_model.score_samples(&anomaly_features)?;
    let flagged = training_scores
        .iter()
        .filter(|s| **s < anomaly_model.threshold)
        .count();
    let anomaly_report = AnomalyTrainingReport {
        threshold: anomaly_model.threshold,
        training_anomaly_rate: flagged as f64 / training_scores.len() as f64,
    };
    log::info!(
        "Anomaly model trained: threshold {:.4}, {:.2}% of training flagged",
        anomaly_model.threshold,
        anomaly_report.training_anomaly_rate * 100.0
    );

    let metadata = ModelMetadata {
        model_version: env!("CARGO_PKG_VERSION").to_string(),
        last_trained: Utc::now().to_rfc3339(),
        training_samples: metrics.len(),
        churn_accuracy: churn_report.accuracy,
        revenue_mae: revenue_report.mae,
        feature_columns: FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect(),
    };
    let report = TrainingReport {
        trained_at: metadata.last_trained.clone(),
        training_customers: metrics.len(),
        training_transactions: transactions.len(),
        churn: churn_report,
        revenue: revenue_report,
        segmentation: segmentation_report,
        anomaly: anomaly_report,
    };

    Ok(TrainingOutcome {
        bundle: ModelBundle {
            churn: churn_model,
            revenue: revenue_model,
            segmentation: segmentation_model,
            anomaly: anomaly_model,
            metadata,
        },
        report,
    })
}

/// Fetches the training window, trains everything and saves the artifact.
/// The existing artifact is only replaced after a fully successful run.
pub async fn run_training(
    config: &AppConfig,
    days_back: i64,
) -> Result<TrainingReport, Box<dyn std::error::Error>> {
    let now = Utc::now().naive_utc();
    let window = AnalysisPeriod {
        start: Some(now - Duration::days(days_back)),
        end: Some(now),
        label: format!("training_{}d", days_back),
    };
    log::info!(
        "Fetching {} days of transactions for training ({} .. {})",
        days_back,
        window.start_string(),
        window.end_string()
    );
    let transactions = DbConnect::fetch_transactions(&config.db, &window).await?;
    log::info!("Training on {} transactions", transactions.len());

    let outcome = train_all_models(&transactions)?;
    outcome.bundle.save(Path::new(&config.model_dir))?;
    log::info!("Model artifact saved to {}", config.model_dir);
    Ok(outcome.report)
}
