// rest_utils.rs
use crate::ai_utils::{chat_history, GroqChatbot};
use crate::config_utils::AppConfig;
use crate::db_utils::{AnalysisPeriod, DbConnect};
use crate::insights_utils::{generate_insights, visualization_data};
use crate::metrics_utils::calculate_customer_metrics;
use crate::ml_utils::{
    is_emerging_customer, segment_statistics, train_all_models, ModelBundle, TrainingReport,
};
use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use chrono::{Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Shared state for all handlers. The model bundle is read-mostly and
/// swapped whole after a successful retrain; everything else is recomputed
/// from the database per request.
pub struct AppState {
    pub config: AppConfig,
    pub models: RwLock<Option<ModelBundle>>,
    pub training: AtomicBool,
    pub chatbot: GroqChatbot,
}

fn error_body(message: &str) -> serde_json::Value {
    json!({"success": false, "error": message})
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(error_body(message))
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::NotFound().json(error_body(message))
}

fn internal_error(message: &str) -> HttpResponse {
    HttpResponse::InternalServerError().json(error_body(message))
}

fn forbidden(message: &str) -> HttpResponse {
    HttpResponse::Forbidden().json(error_body(message))
}

fn service_unavailable(message: &str) -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(error_body(message))
}

const NO_DATA: &str = "No data found for specified period";
const MODELS_NOT_TRAINED: &str =
    "ML models not trained. Trigger POST /api/ml/train and retry once training completes.";

/// ML endpoints default to the last 30 days when no explicit window is given.
fn ml_window(
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<AnalysisPeriod, Box<dyn std::error::Error>> {
    match (start_date, end_date) {
        (None, None) => {
            let today = Local::now().format("%Y-%m-%d").to_string();
            let month_ago = (Local::now() - Duration::days(30))
                .format("%Y-%m-%d")
                .to_string();
            AnalysisPeriod::resolve(None, Some(month_ago.as_str()), Some(today.as_str()))
        }
        _ => AnalysisPeriod::resolve(None, start_date, end_date),
    }
}

// ---------------------------------------------------------------------------
// Query/body types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct InsightsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    period: Option<String>,
    compare: Option<bool>,
}

#[derive(Deserialize)]
pub struct VisualizationQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    period: Option<String>,
    chart_type: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    message: String,
    user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ChurnQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    min_probability: Option<f64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ForecastQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    months: Option<u32>,
    top_n: Option<usize>,
}

#[derive(Deserialize)]
pub struct WindowQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Deserialize)]
pub struct SegmentCustomersQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct AnomalyQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct TrainQuery {
    days_back: Option<i64>,
    admin_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Core endpoints
// ---------------------------------------------------------------------------

pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Jalikoi Analytics API with ML & Groq AI Chatbot",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/api/health",
            "insights": "/api/insights",
            "visualizations": "/api/visualizations",
            "chatbot": "/api/chatbot",
            "chatbot_history": "/api/chatbot/history/{user_id}",
            "ml_model_info": "/api/ml/model-info",
            "ml_churn_predictions": "/api/ml/churn-predictions",
            "ml_revenue_forecast": "/api/ml/revenue-forecast",
            "ml_segments": "/api/ml/segments",
            "ml_segment_customers": "/api/ml/segment-customers/{segment_name}",
            "ml_anomalies": "/api/ml/anomalies",
            "ml_train": "/api/ml/train",
        }
    }))
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let database = match DbConnect::ping(&state.config.db).await {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let models_loaded = state.models.read().unwrap().is_some();
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "database": database,
        "models_loaded": models_loaded,
        "training_in_progress": state.training.load(Ordering::SeqCst),
        "chatbot_configured": state.chatbot.is_configured(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn insights(
    state: web::Data<AppState>,
    params: web::Query<InsightsQuery>,
) -> HttpResponse {
    let period = match AnalysisPeriod::resolve(
        params.period.as_deref(),
        params.start_date.as_deref(),
        params.end_date.as_deref(),
    ) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };

    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    if transactions.is_empty() {
        return not_found(NO_DATA);
    }

    let mut previous = None;
    if params.compare.unwrap_or(false) {
        if let Some(prev_period) = period.previous() {
            match DbConnect::fetch_transactions(&state.config.db, &prev_period).await {
                Ok(prev) if !prev.is_empty() => previous = Some(prev),
                Ok(_) => {}
                Err(e) => log::warn!("Comparison window fetch failed: {}", e),
            }
        }
    }

    let report = generate_insights(&transactions, &period, previous.as_deref());
    HttpResponse::Ok().json(json!({"success": true, "data": report}))
}

pub async fn visualizations(
    state: web::Data<AppState>,
    params: web::Query<VisualizationQuery>,
) -> HttpResponse {
    let period = match AnalysisPeriod::resolve(
        params.period.as_deref(),
        params.start_date.as_deref(),
        params.end_date.as_deref(),
    ) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };

    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    if transactions.is_empty() {
        return not_found(NO_DATA);
    }

    match visualization_data(params.chart_type.as_deref().unwrap_or("all"), &transactions) {
        Ok(data) => HttpResponse::Ok().json(json!({"success": true, "data": data})),
        Err(e) => bad_request(&e.to_string()),
    }
}

pub async fn chatbot(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> HttpResponse {
    if !state.chatbot.is_configured() {
        return service_unavailable(
            "Groq chatbot not initialized. Set GROQ_API_KEY environment variable.",
        );
    }
    let user_id = body.user_id.as_deref().unwrap_or("default");
    match state.chatbot.chat(&body.message, user_id).await {
        Ok(reply) => HttpResponse::Ok().json(json!({
            "success": true,
            "message": reply,
            "data": {},
        })),
        Err(e) => internal_error(&format!("Error: {}", e)),
    }
}

pub async fn chatbot_history(
    user_id: web::Path<String>,
    params: web::Query<HistoryQuery>,
) -> HttpResponse {
    let limit = params.limit.unwrap_or(20);
    HttpResponse::Ok().json(json!({
        "success": true,
        "user_id": user_id.as_str(),
        "messages": chat_history(&user_id, limit),
    }))
}

// ---------------------------------------------------------------------------
// ML endpoints
// ---------------------------------------------------------------------------

pub async fn model_info(state: web::Data<AppState>) -> HttpResponse {
    let guard = state.models.read().unwrap();
    match guard.as_ref() {
        Some(bundle) => {
            let mut info = bundle.model_info();
            info["models_loaded"] = json!(true);
            HttpResponse::Ok().json(json!({"success": true, "data": info}))
        }
        None => HttpResponse::Ok().json(json!({
            "success": true,
            "data": {"models_loaded": false},
        })),
    }
}

#[derive(Serialize)]
struct ChurnRow {
    customer_id: String,
    churn_probability: f64,
    risk_level: String,
    total_spent: f64,
    transactions: u64,
    recency_days: f64,
    prediction: String,
}

pub async fn churn_predictions(
    state: web::Data<AppState>,
    params: web::Query<ChurnQuery>,
) -> HttpResponse {
    let period = match ml_window(params.start_date.as_deref(), params.end_date.as_deref()) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    let metrics = calculate_customer_metrics(&transactions);
    if metrics.is_empty() {
        return not_found(NO_DATA);
    }

    let min_probability = params.min_probability.unwrap_or(0.0);
    let limit = params.limit.unwrap_or(100);

    let guard = state.models.read().unwrap();
    let bundle = match guard.as_ref() {
        Some(b) => b,
        None => return service_unavailable(MODELS_NOT_TRAINED),
    };
    let predictions = match bundle.churn.predict_customers(&metrics) {
        Ok(p) => p,
        Err(e) => return internal_error(&format!("Churn prediction failed: {}", e)),
    };

    let mut rows: Vec<ChurnRow> = metrics
        .iter()
        .zip(&predictions)
        .filter(|(_, p)| p.churn_probability >= min_probability)
        .map(|(m, p)| ChurnRow {
            customer_id: m.customer_id.clone(),
            churn_probability: p.churn_probability,
            risk_level: p.risk_level.clone(),
            total_spent: m.total_spent,
            transactions: m.transaction_count,
            recency_days: m.recency_days,
            prediction: if p.churn_prediction {
                "Will Churn".to_string()
            } else {
                "Will Retain".to_string()
            },
        })
        .collect();
    rows.sort_by(|a, b| {
        b.churn_probability
            .partial_cmp(&a.churn_probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows.truncate(limit);
    let high_risk_count = rows.iter().filter(|r| r.risk_level == "High Risk").count();

    HttpResponse::Ok().json(json!({
        "success": true,
        "model_type": "RandomForestClassifier",
        "model_accuracy": bundle.metadata.churn_accuracy,
        "total_customers_analyzed": metrics.len(),
        "high_risk_count": high_risk_count,
        "customers_at_risk": rows,
    }))
}

#[derive(Serialize)]
struct ForecastRow {
    customer_id: String,
    predicted_revenue: f64,
    historical_revenue: f64,
    transactions: u64,
    confidence: String,
    forecast_period_months: u32,
}

pub async fn revenue_forecast(
    state: web::Data<AppState>,
    params: web::Query<ForecastQuery>,
) -> HttpResponse {
    let period = match ml_window(params.start_date.as_deref(), params.end_date.as_deref()) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    let metrics = calculate_customer_metrics(&transactions);
    if metrics.is_empty() {
        return not_found(NO_DATA);
    }

    let months = params.months.unwrap_or(6);
    let top_n = params.top_n.unwrap_or(50);

    let guard = state.models.read().unwrap();
    let bundle = match guard.as_ref() {
        Some(b) => b,
        None => return service_unavailable(MODELS_NOT_TRAINED),
    };
    let mut forecasts = match bundle.revenue.forecast_customers(&metrics, months as f64) {
        Ok(f) => f,
        Err(e) => return internal_error(&format!("Revenue forecast failed: {}", e)),
    };
    forecasts.sort_by(|a, b| {
        b.predicted_revenue
            .partial_cmp(&a.predicted_revenue)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    forecasts.truncate(top_n);

    let total_forecast: f64 = forecasts.iter().map(|f| f.predicted_revenue).sum();
    let rows: Vec<ForecastRow> = forecasts
        .into_iter()
        .map(|f| ForecastRow {
            customer_id: f.customer_id,
            predicted_revenue: f.predicted_revenue,
            historical_revenue: f.historical_revenue,
            transactions: f.transactions,
            confidence: f.confidence,
            forecast_period_months: months,
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "success": true,
        "model_type": "GradientBoostingRegressor",
        "model_mae": bundle.metadata.revenue_mae,
        "forecast_period_months": months,
        "total_customers_analyzed": metrics.len(),
        "total_forecasted_revenue": (total_forecast * 100.0).round() / 100.0,
        "top_customers_forecast": rows,
    }))
}

pub async fn segments(
    state: web::Data<AppState>,
    params: web::Query<WindowQuery>,
) -> HttpResponse {
    let period = match ml_window(params.start_date.as_deref(), params.end_date.as_deref()) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    let metrics = calculate_customer_metrics(&transactions);
    if metrics.is_empty() {
        return not_found(NO_DATA);
    }

    let guard = state.models.read().unwrap();
    let bundle = match guard.as_ref() {
        Some(b) => b,
        None => return service_unavailable(MODELS_NOT_TRAINED),
    };
    let assignments = match bundle.segmentation.assign_customers(&metrics) {
        Ok(a) => a,
        Err(e) => return internal_error(&format!("Segmentation failed: {}", e)),
    };
    let stats = segment_statistics(&assignments, &metrics);

    HttpResponse::Ok().json(json!({
        "success": true,
        "model_type": "KMeans",
        "n_clusters": bundle.segmentation.n_clusters(),
        "total_customers_analyzed": metrics.len(),
        "segments": stats,
    }))
}

#[derive(Serialize)]
struct SegmentCustomerRow {
    customer_id: String,
    first_transaction: String,
    last_transaction: String,
    total_spent: f64,
    transactions: u64,
    cluster: usize,
}

pub async fn segment_customers(
    state: web::Data<AppState>,
    segment_name: web::Path<String>,
    params: web::Query<SegmentCustomersQuery>,
) -> HttpResponse {
    let period = match ml_window(None, None) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    let metrics = calculate_customer_metrics(&transactions);
    if metrics.is_empty() {
        return not_found(NO_DATA);
    }

    let limit = params.limit.unwrap_or(5000);

    let guard = state.models.read().unwrap();
    let bundle = match guard.as_ref() {
        Some(b) => b,
        None => return service_unavailable(MODELS_NOT_TRAINED),
    };
    let assignments = match bundle.segmentation.assign_customers(&metrics) {
        Ok(a) => a,
        Err(e) => return internal_error(&format!("Segmentation failed: {}", e)),
    };

    let mut members: Vec<SegmentCustomerRow> = assignments
        .iter()
        .zip(&metrics)
        .filter(|(a, m)| {
            a.segment_name == *segment_name
                && (segment_name.as_str() != "New Customers" || is_emerging_customer(m))
        })
        .map(|(a, m)| SegmentCustomerRow {
            customer_id: m.customer_id.clone(),
            first_transaction: m.first_transaction.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_transaction: m.last_transaction.format("%Y-%m-%d %H:%M:%S").to_string(),
            total_spent: m.total_spent,
            transactions: m.transaction_count,
            cluster: a.cluster,
        })
        .collect();
    let total_customers = members.len();
    members.sort_by(|a, b| b.first_transaction.cmp(&a.first_transaction));
    members.truncate(limit);

    HttpResponse::Ok().json(json!({
        "success": true,
        "segment_name": segment_name.as_str(),
        "total_customers": total_customers,
        "customers_returned": members.len(),
        "customers": members,
    }))
}

pub async fn anomalies(
    state: web::Data<AppState>,
    params: web::Query<AnomalyQuery>,
) -> HttpResponse {
    let period = match ml_window(params.start_date.as_deref(), params.end_date.as_deref()) {
        Ok(p) => p,
        Err(e) => return bad_request(&e.to_string()),
    };
    let transactions = match DbConnect::fetch_transactions(&state.config.db, &period).await {
        Ok(t) => t,
        Err(e) => return internal_error(&format!("Error fetching data: {}", e)),
    };
    if transactions.is_empty() {
        return not_found(NO_DATA);
    }

    let limit = params.limit.unwrap_or(100);

    let guard = state.models.read().unwrap();
    let bundle = match guard.as_ref() {
        Some(b) => b,
        None => return service_unavailable(MODELS_NOT_TRAINED),
    };
    let flags = match bundle.anomaly.detect(&transactions) {
        Ok(f) => f,
        Err(e) => return internal_error(&format!("Anomaly detection failed: {}", e)),
    };

    let mut anomalous: Vec<_> = flags.into_iter().filter(|f| f.is_anomaly).collect();
    let total_detected = anomalous.len();
    anomalous.truncate(limit);
    let anomaly_rate = total_detected as f64 / transactions.len() as f64 * 100.0;

    HttpResponse::Ok().json(json!({
        "success": true,
        "model_type": "IsolationForest",
        "period": {"start_date": period.start_string(), "end_date": period.end_string()},
        "total_transactions_analyzed": transactions.len(),
        "total_anomalies_detected": total_detected,
        "anomaly_rate": (anomaly_rate * 100.0).round() / 100.0,
        "anomalies": anomalous,
    }))
}

async fn run_background_training(state: web::Data<AppState>, days_back: i64) {
    let started = std::time::Instant::now();
    let now = Utc::now().naive_utc();
    let window = AnalysisPeriod {
        start: Some(now - Duration::days(days_back)),
        end: Some(now),
        label: format!("training_{}d", days_back),
    };

    let result: Result<TrainingReport, String> = async {
        let transactions = DbConnect::fetch_transactions(&state.config.db, &window)
            .await
            .map_err(|e| e.to_string())?;
        log::info!(
            "Background training on {} transactions ({} days)",
            transactions.len(),
            days_back
        );
        let outcome = tokio::task::spawn_blocking(move || {
            train_all_models(&transactions).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())??;

        outcome
            .bundle
            .save(Path::new(&state.config.model_dir))
            .map_err(|e| e.to_string())?;
        *state.models.write().unwrap() = Some(outcome.bundle);
        Ok(outcome.report)
    }
    .await;

    state.training.store(false, Ordering::SeqCst);
    match result {
        Ok(report) => log::info!(
            "Training finished in {:.1}s: churn accuracy {:.3}, revenue MAE {:.0} RWF",
            started.elapsed().as_secs_f64(),
            report.churn.accuracy,
            report.revenue.mae
        ),
        Err(e) => log::error!("Background training failed: {}", e),
    }
}

pub async fn train_models(
    state: web::Data<AppState>,
    params: web::Query<TrainQuery>,
) -> HttpResponse {
    if params.admin_key.as_deref() != Some(state.config.admin_key.as_str()) {
        return forbidden("Invalid admin key");
    }
    let days_back = params.days_back.unwrap_or(90);
    if days_back < 1 {
        return bad_request("days_back must be at least 1");
    }

    if state
        .training
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return HttpResponse::Conflict().json(error_body("Training already in progress"));
    }

    tokio::spawn(run_background_training(state.clone(), days_back));

    HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Model training started in background",
        "days_back": days_back,
        "note": "Training may take several minutes depending on data size",
    }))
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/api/health", web::get().to(health))
        .route("/api/insights", web::get().to(insights))
        .route("/api/visualizations", web::get().to(visualizations))
        .route("/api/chatbot", web::post().to(chatbot))
        .route("/api/chatbot/history/{user_id}", web::get().to(chatbot_history))
        .route("/api/ml/model-info", web::get().to(model_info))
        .route("/api/ml/churn-predictions", web::get().to(churn_predictions))
        .route("/api/ml/revenue-forecast", web::get().to(revenue_forecast))
        .route("/api/ml/segments", web::get().to(segments))
        .route(
            "/api/ml/segment-customers/{segment_name}",
            web::get().to(segment_customers),
        )
        .route("/api/ml/anomalies", web::get().to(anomalies))
        .route("/api/ml/train", web::post().to(train_models));
}

/// Loads the model artifact if present and serves the API until shutdown.
pub async fn run_server(config: AppConfig) -> std::io::Result<()> {
    let initial = match ModelBundle::load(Path::new(&config.model_dir)) {
        Ok(bundle) => {
            log::info!(
                "Loaded model artifact from {} (trained {})",
                config.model_dir,
                bundle.metadata.last_trained
            );
            Some(bundle)
        }
        Err(e) => {
            log::warn!(
                "No model artifact loaded from {}: {}. ML endpoints return 503 until trained.",
                config.model_dir,
                e
            );
            None
        }
    };

    let chatbot = GroqChatbot::new(config.groq.clone(), config.db.clone());
    if !chatbot.is_configured() {
        log::warn!("GROQ_API_KEY not set. Chatbot endpoints will return 503.");
    }

    let bind_addr = config.bind_addr.clone();
    let state = web::Data::new(AppState {
        config,
        models: RwLock::new(initial),
        training: AtomicBool::new(false),
        chatbot,
    });

    log::info!("Starting Jalikoi Analytics API on {}", bind_addr);
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .bind(bind_addr)?
    .run()
    .await
}
