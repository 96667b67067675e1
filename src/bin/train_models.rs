// train_models.rs
//! Offline model training CLI.
//!
//! Usage:
//!   train-models --days-back 90
//!   train-models --days-back 180 --model-dir /var/lib/jalikoi/models

use dotenv::dotenv;
use jalikoi_analytics::config_utils::AppConfig;
use jalikoi_analytics::ml_utils::run_training;
use std::env;

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = env::args().collect();
    let days_back = parse_arg(&args, "--days-back", 90i64);
    let mut config = AppConfig::from_env();
    if let Some(dir) = args
        .windows(2)
        .find(|w| w[0] == "--model-dir")
        .map(|w| w[1].clone())
    {
        config.model_dir = dir;
    }

    let report = run_training(&config, days_back).await?;

    println!("=== TRAINING SUMMARY ===");
    println!("  trained at:    {}", report.trained_at);
    println!("  customers:     {}", report.training_customers);
    println!("  transactions:  {}", report.training_transactions);
    println!("  artifact dir:  {}", config.model_dir);

    println!();
    println!("=== CHURN / RANDOM FOREST ===");
    println!("  accuracy:     {:.3}", report.churn.accuracy);
    println!("  precision:    {:.3}", report.churn.precision);
    println!("  recall:       {:.3}", report.churn.recall);
    println!("  f1:           {:.3}", report.churn.f1);
    println!(
        "  cv accuracy:  {:.3} +/- {:.3}",
        report.churn.cv_accuracy_mean, report.churn.cv_accuracy_std
    );
    let cm = report.churn.confusion_matrix;
    println!("  confusion:    [tn {} fp {}] [fn {} tp {}]", cm[0][0], cm[0][1], cm[1][0], cm[1][1]);
    println!("  top features:");
    for (name, importance) in report.churn.feature_importance.iter().take(5) {
        println!("    {:<24} {:.4}", name, importance);
    }

    println!();
    println!("=== REVENUE / GRADIENT BOOSTING ===");
    println!("  mae:   {:.0} RWF", report.revenue.mae);
    println!("  rmse:  {:.0} RWF", report.revenue.rmse);
    println!("  r2:    {:.3}", report.revenue.r2);

    println!();
    println!("=== SEGMENTATION / KMEANS ===");
    println!("  clusters: {}", report.segmentation.n_clusters);
    println!("  inertia:  {:.1}", report.segmentation.inertia);
    for (name, count) in &report.segmentation.segment_sizes {
        println!("  {:>5}  {}", count, name);
    }

    println!();
    println!("=== ANOMALY / ISOLATION FOREST ===");
    println!("  score threshold:  {:.4}", report.anomaly.threshold);
    println!(
        "  training anomaly rate:  {:.2}%",
        report.anomaly.training_anomaly_rate * 100.0
    );

    Ok(())
}
