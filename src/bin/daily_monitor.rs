// daily_monitor.rs
//! Daily customer-health monitoring CLI.
//!
//! Usage:
//!   daily-monitor
//!   daily-monitor --days-back 90 --alert-threshold 60 --export-csv --output-dir outputs
//!
//! Prints a health dashboard over the recent transaction window, raises
//! intervention alerts, and optionally exports the action items plus a
//! per-customer health report as CSV for the retention team.

use anyhow::Result as AnyhowResult;
use chrono::{Duration, Utc};
use dotenv::dotenv;
use jalikoi_analytics::config_utils::AppConfig;
use jalikoi_analytics::db_utils::{AnalysisPeriod, DbConnect, TransactionRecord};
use jalikoi_analytics::metrics_utils::{
    calculate_customer_metrics, compute_clv, compute_health_scores, quantile, ClvProjection,
    CustomerMetrics, HealthScore,
};
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::path::Path;

struct Alert {
    level: &'static str,
    kind: &'static str,
    message: String,
    action: &'static str,
    customers: Vec<String>,
}

struct Trends {
    yesterday_revenue: f64,
    yesterday_count: usize,
    revenue_trend: f64,
    volume_trend: f64,
}

struct ActionItem {
    priority: usize,
    level: &'static str,
    kind: &'static str,
    action: &'static str,
    details: String,
    affected: usize,
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

/// Customer-level alerts: critical health, high-value accounts trending down,
/// and absences running past twice the typical gap.
fn detect_issues(
    metrics: &[CustomerMetrics],
    clv: &[ClvProjection],
    health: &[HealthScore],
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let critical: Vec<String> = health
        .iter()
        .filter(|h| h.status == "Critical")
        .map(|h| h.customer_id.clone())
        .collect();
    if !critical.is_empty() {
        alerts.push(Alert {
            level: "CRITICAL",
            kind: "CHURN_RISK",
            message: format!("{} customers in CRITICAL health status", critical.len()),
            action: "Immediate personal outreach required",
            customers: critical,
        });
    }

    let mut clv_values: Vec<f64> = clv.iter().map(|c| c.predicted_clv_6m).collect();
    clv_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let clv_cutoff = quantile(&clv_values, 0.7);
    let mut at_risk_value = 0.0;
    let high_value_at_risk: Vec<String> = metrics
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            clv[*i].predicted_clv_6m > clv_cutoff
                && matches!(health[*i].status.as_str(), "Critical" | "Warning")
        })
        .map(|(i, m)| {
            at_risk_value += clv[i].predicted_clv_6m;
            m.customer_id.clone()
        })
        .collect();
    if !high_value_at_risk.is_empty() {
        alerts.push(Alert {
            level: "HIGH",
            kind: "HIGH_VALUE_RISK",
            message: format!(
                "{} high-value customers showing warning signs ({:.0} RWF of 6-month CLV at stake)",
                high_value_at_risk.len(),
                at_risk_value
            ),
            action: "Launch retention campaign",
            customers: high_value_at_risk,
        });
    }

    let mut recencies: Vec<f64> = metrics.iter().map(|m| m.recency_days).collect();
    recencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_recency = quantile(&recencies, 0.5);
    let absent: Vec<String> = metrics
        .iter()
        .filter(|m| m.recency_days > median_recency * 2.0)
        .map(|m| m.customer_id.clone())
        .collect();
    if !absent.is_empty() {
        alerts.push(Alert {
            level: "MEDIUM",
            kind: "UNUSUAL_ABSENCE",
            message: format!("{} customers absent longer than usual", absent.len()),
            action: "Send re-engagement campaign",
            customers: absent,
        });
    }

    alerts
}

/// Yesterday's successful volume against the trailing 7-day daily average.
/// Drops past 20% raise HIGH alerts.
fn analyze_trends(transactions: &[TransactionRecord], alerts: &mut Vec<Alert>) -> Trends {
    let now = Utc::now().naive_utc();
    let yesterday = now - Duration::days(1);
    let last_week = now - Duration::days(7);

    let successful: Vec<&TransactionRecord> =
        transactions.iter().filter(|t| t.is_successful()).collect();

    let yesterday_revenue: f64 = successful
        .iter()
        .filter(|t| t.created_at >= yesterday)
        .map(|t| t.amount)
        .sum();
    let yesterday_count = successful.iter().filter(|t| t.created_at >= yesterday).count();

    let mut per_day: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for t in successful.iter().filter(|t| t.created_at >= last_week) {
        let entry = per_day
            .entry(t.created_at.format("%Y-%m-%d").to_string())
            .or_insert((0.0, 0));
        entry.0 += t.amount;
        entry.1 += 1;
    }
    let days = per_day.len().max(1) as f64;
    let avg_daily_revenue: f64 = per_day.values().map(|(r, _)| r).sum::<f64>() / days;
    let avg_daily_count: f64 = per_day.values().map(|(_, c)| *c as f64).sum::<f64>() / days;

    let revenue_trend = if avg_daily_revenue > 0.0 {
        (yesterday_revenue / avg_daily_revenue - 1.0) * 100.0
    } else {
        0.0
    };
    let volume_trend = if avg_daily_count > 0.0 {
        (yesterday_count as f64 / avg_daily_count - 1.0) * 100.0
    } else {
        0.0
    };

    if revenue_trend < -20.0 {
        alerts.push(Alert {
            level: "HIGH",
            kind: "REVENUE_DROP",
            message: format!(
                "Revenue down {:.1}% vs 7-day average ({:.0} RWF yesterday, {:.0} RWF expected)",
                revenue_trend.abs(),
                yesterday_revenue,
                avg_daily_revenue
            ),
            action: "Investigate cause: station issues, payment problems, or external factors",
            customers: Vec::new(),
        });
    }
    if volume_trend < -20.0 {
        alerts.push(Alert {
            level: "HIGH",
            kind: "VOLUME_DROP",
            message: format!(
                "Transaction volume down {:.1}% vs 7-day average ({} yesterday, {:.1} expected)",
                volume_trend.abs(),
                yesterday_count,
                avg_daily_count
            ),
            action: "Check system availability and customer engagement",
            customers: Vec::new(),
        });
    }

    Trends {
        yesterday_revenue,
        yesterday_count,
        revenue_trend,
        volume_trend,
    }
}

fn priority_actions(alerts: &[Alert], health: &[HealthScore]) -> Vec<ActionItem> {
    fn rank(level: &str) -> usize {
        match level {
            "CRITICAL" => 1,
            "HIGH" => 2,
            "MEDIUM" => 3,
            _ => 4,
        }
    }

    let mut ordered: Vec<&Alert> = alerts.iter().collect();
    ordered.sort_by_key(|a| rank(a.level));

    let mut actions: Vec<ActionItem> = ordered
        .iter()
        .enumerate()
        .map(|(i, a)| ActionItem {
            priority: i + 1,
            level: a.level,
            kind: a.kind,
            action: a.action,
            details: a.message.clone(),
            affected: a.customers.len(),
        })
        .collect();

    let excellent = health.iter().filter(|h| h.status == "Excellent").count();
    if excellent > 0 {
        actions.push(ActionItem {
            priority: actions.len() + 1,
            level: "PROACTIVE",
            kind: "REWARD_LOYALTY",
            action: "Thank and reward excellent customers",
            details: format!("{} customers in excellent health", excellent),
            affected: excellent,
        });
    }

    actions
}

fn print_dashboard(
    metrics: &[CustomerMetrics],
    clv: &[ClvProjection],
    health: &[HealthScore],
    trends: &Trends,
    alerts: &[Alert],
    alert_threshold: f64,
) {
    let today = Utc::now().format("%B %d, %Y");
    println!("{}", "=".repeat(72));
    println!("JALIKOI DAILY MONITORING DASHBOARD - {}", today);
    println!("{}", "=".repeat(72));

    println!();
    println!("=== OVERALL HEALTH ===");
    let total = health.len().max(1);
    for status in ["Excellent", "Good", "Warning", "Critical"] {
        let count = health.iter().filter(|h| h.status == status).count();
        let pct = count as f64 / total as f64 * 100.0;
        println!("  {:<10} {:>5} customers ({:>5.1}%)", status, count, pct);
    }
    let watchlist = health
        .iter()
        .filter(|h| h.health_score < alert_threshold)
        .count();
    println!(
        "  {} customers below the health threshold of {:.0}",
        watchlist, alert_threshold
    );

    println!();
    println!("=== RECENT PERFORMANCE (last 24h vs 7-day average) ===");
    println!(
        "  revenue:      {:>14.2} RWF ({:+.1}%)",
        trends.yesterday_revenue, trends.revenue_trend
    );
    println!(
        "  transactions: {:>14} ({:+.1}%)",
        trends.yesterday_count, trends.volume_trend
    );

    println!();
    if alerts.is_empty() {
        println!("=== NO CRITICAL ALERTS ===");
        println!("  All systems operating normally. Continue monitoring.");
    } else {
        println!("=== ALERTS REQUIRING ATTENTION ===");
        for alert in alerts {
            println!();
            println!("  [{}] {}", alert.level, alert.kind);
            println!("    {}", alert.message);
            println!("    Action: {}", alert.action);
            if !alert.customers.is_empty() && alert.customers.len() <= 5 {
                println!("    Affected: {}", alert.customers.join(", "));
            } else if !alert.customers.is_empty() {
                println!("    Affected: {} customers", alert.customers.len());
            }
        }
    }

    println!();
    println!("=== TOP 5 CUSTOMERS BY 6-MONTH CLV ===");
    let mut order: Vec<usize> = (0..metrics.len()).collect();
    order.sort_by(|a, b| {
        clv[*b]
            .predicted_clv_6m
            .partial_cmp(&clv[*a].predicted_clv_6m)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in order.into_iter().take(5) {
        println!(
            "  {:<14} {:>12.0} RWF  {:<10} last seen {:.0}d ago",
            metrics[i].customer_id, clv[i].predicted_clv_6m, health[i].status,
            metrics[i].recency_days
        );
    }
    println!();
    println!("{}", "=".repeat(72));
}

fn export_action_items(actions: &[ActionItem], path: &Path) -> AnyhowResult<()> {
    let file = File::create(path)?;
    let mut wtr = csv::Writer::from_writer(file);
    wtr.write_record(["priority", "level", "type", "action", "details", "affected_customers"])?;
    for a in actions {
        wtr.write_record([
            a.priority.to_string(),
            a.level.to_string(),
            a.kind.to_string(),
            a.action.to_string(),
            a.details.clone(),
            a.affected.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn export_health_report(
    metrics: &[CustomerMetrics],
    clv: &[ClvProjection],
    health: &[HealthScore],
    path: &Path,
) -> AnyhowResult<()> {
    let file = File::create(path)?;
    let mut wtr = csv::Writer::from_writer(file);
    wtr.write_record([
        "customer_id",
        "transactions",
        "total_spent",
        "avg_transaction",
        "stations_used",
        "days_since_last",
        "customer_age_days",
        "frequency",
        "health_score",
        "health_status",
        "projected_clv_6m",
    ])?;
    for (i, m) in metrics.iter().enumerate() {
        wtr.write_record([
            m.customer_id.clone(),
            m.transaction_count.to_string(),
            format!("{:.2}", m.total_spent),
            format!("{:.2}", m.avg_transaction),
            m.station_diversity.to_string(),
            format!("{:.1}", m.recency_days),
            format!("{:.1}", m.customer_age_days),
            format!("{:.4}", m.frequency),
            format!("{:.1}", health[i].health_score),
            health[i].status.clone(),
            format!("{:.2}", clv[i].predicted_clv_6m),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = env::args().collect();
    let days_back = parse_arg(&args, "--days-back", 90i64);
    let alert_threshold = parse_arg(&args, "--alert-threshold", 60.0f64);
    let export_csv = args.iter().any(|a| a == "--export-csv");
    let output_dir = args
        .windows(2)
        .find(|w| w[0] == "--output-dir")
        .map(|w| w[1].clone())
        .unwrap_or_else(|| "outputs".to_string());

    let config = AppConfig::from_env();
    let now = Utc::now().naive_utc();
    let window = AnalysisPeriod {
        start: Some(now - Duration::days(days_back)),
        end: Some(now),
        label: format!("monitor_{}d", days_back),
    };

    let transactions = DbConnect::fetch_transactions(&config.db, &window).await?;
    if transactions.is_empty() {
        println!("No transactions in the last {} days. Nothing to monitor.", days_back);
        return Ok(());
    }

    let metrics = calculate_customer_metrics(&transactions);
    let clv = compute_clv(&metrics);
    let health = compute_health_scores(&metrics);

    let mut alerts = detect_issues(&metrics, &clv, &health);
    let trends = analyze_trends(&transactions, &mut alerts);
    print_dashboard(&metrics, &clv, &health, &trends, &alerts, alert_threshold);

    if export_csv {
        std::fs::create_dir_all(&output_dir)?;
        let actions = priority_actions(&alerts, &health);
        let actions_path = Path::new(&output_dir).join("daily_action_items.csv");
        export_action_items(&actions, &actions_path)?;
        println!("Action items exported to {}", actions_path.display());

        let report_path = Path::new(&output_dir).join("customer_health_report.csv");
        export_health_report(&metrics, &clv, &health, &report_path)?;
        println!("Customer health report exported to {}", report_path.display());
    }

    Ok(())
}
