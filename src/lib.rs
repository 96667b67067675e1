// lib.rs
//! # JALIKOI ANALYTICS
//!
//! Customer analytics and machine learning engine for the Jalikoi fuel-station
//! payments platform. Replicates the classic Pandas + Scikit-Learn analytics
//! workflow in native RUST: MYSQL powered customer metrics, RANDOM FOREST churn
//! prediction, GRADIENT BOOSTING revenue forecasting, KMEANS segmentation,
//! ISOLATION FOREST anomaly detection, and a Groq LLM chatbot with function
//! calling, all served over a REST API.
//!
//! End-to-end data flow is deliberately linear: database query → typed record
//! batch → feature engineering → model fit/predict → JSON response. Nothing is
//! cached between requests; the payments table is the single source of truth.
//!
//! ## `config_utils`
//!
//! - **Purpose**: Environment-driven runtime configuration.
//! - **Features**:
//!   - Database, Groq, server and model-store settings resolved from the environment with the platform's defaults.
//!   - One `AppConfig::from_env()` call at startup; no config files to drift.
//!
//! ## `db_utils`
//!
//! - **Purpose**: Query the MYSQL payments database with simple elegant syntax.
//! - **Features**:
//!   - **DbConnect**: Async MYSQL access to the `DailyTransactionPayments` table.
//!   - Date-window parameterized fetches via **AnalysisPeriod** (`today`, `yesterday`, `week`, `month`, `all`, or explicit `start_date`/`end_date`).
//!   - Typed `TransactionRecord` rows; connectivity health checks.
//!
//! ## `metrics_utils`
//!
//! - **Purpose**: Group-by customer aggregation, replicating the platform's Pandas metrics.
//! - **Features**:
//!   - **calculate_customer_metrics**: one `CustomerMetrics` row per motorcyclist (recency, frequency, monetary stats, station diversity, app usage, failure rate).
//!   - 6-month CLV projection with churn-factor adjustment and value tiers.
//!   - Heuristic churn-risk scoring (0-100) and classic RFM segmentation.
//!
//! ## `feature_utils`
//!
//! - **Purpose**: The canonical model feature schema, shared by training and inference.
//! - **Features**:
//!   - 14-column feature matrix (11 base + 3 derived ratios) built in a fixed order.
//!   - Schema validation before any model sees a matrix: width, finiteness, NaN policy.
//!   - **StandardScaler**: per-model z-score scaling with serializable fit state.
//!
//! ## `ml_utils`
//!
//! - **Purpose**: Train, persist and serve the four models.
//! - **Features**:
//!   - **ChurnModel**: bootstrap forest of decision trees with vote-fraction probabilities.
//!   - **RevenueModel**: gradient boosted regression trees with realism-constrained outputs.
//!   - **SegmentationModel**: KMEANS (k-means++ init, 10 restarts) with business segment names.
//!   - **AnomalyModel**: isolation forest over per-transaction features.
//!   - **ModelBundle**: MessagePack artifact + JSON metadata, loaded once at startup, swapped atomically after retrains.
//!
//! ## `insights_utils`
//!
//! - **Purpose**: Business-facing aggregates for a date window.
//! - **Features**:
//!   - Revenue/customer/segmentation/churn/CLV overviews, top customers, station performance, hourly and daily trends.
//!   - Period-over-period comparison against the adjacent previous window.
//!   - Chart-ready label/value series for the visualization endpoints.
//!
//! ## `ai_utils`
//!
//! - **Purpose**: Natural-language analytics via the Groq chat-completions API.
//! - **Features**:
//!   - Two-phase function-calling loop over live database aggregates (stats, top customers, station performance, revenue trend).
//!   - Per-user bounded in-memory conversation history.
//!   - RWF-aware system prompt with the current reporting dates.
//!
//! ## `api_utils`
//!
//! - **Purpose**: Gracefully make API calls.
//! - **Features**:
//!   - **ApiCallBuilder**: POST JSON payloads with configurable retry/backoff.
//!
//! ## `rest_utils`
//!
//! - **Purpose**: The HTTP surface (actix-web).
//! - **Features**:
//!   - `{"success": bool, "data": ...}` envelopes; 404 on empty windows, 403 on bad admin keys, 503 while models are missing.
//!   - Insights, visualizations, chatbot, model-info, churn, revenue-forecast, segments, anomaly and admin retrain routes.
//!   - Background retraining with an in-flight guard; CORS enabled.
//!
//! ## License
//!
//! This project is licensed under the MIT License - see the LICENSE file for details.

pub mod ai_utils;
pub mod api_utils;
pub mod config_utils;
pub mod db_utils;
pub mod feature_utils;
pub mod insights_utils;
pub mod metrics_utils;
pub mod ml_utils;
pub mod rest_utils;
