// db_utils.rs
use crate::config_utils::DbConfig;
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use mysql_async::{prelude::*, OptsBuilder, Pool, Row as MySqlRow};

/// The payments table read by every analytics query.
pub const TRANSACTIONS_TABLE: &str = "DailyTransactionPayments";

/// Payment status code recorded for successful transactions.
pub const STATUS_SUCCESS: i32 = 200;
/// Payment status code recorded for failed transactions.
pub const STATUS_FAILED: i32 = 500;

/// A single row of the `DailyTransactionPayments` table, typed for analytics.
/// The analytics layer only ever reads these; the source table is immutable
/// from this side.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub id: u64,
    pub station_id: String,
    pub motorcyclist_id: String,
    pub source: String,
    pub fuel_type: String,
    pub liter: f64,
    pub pump_price: f64,
    pub amount: f64,
    pub payment_status: i32,
    pub payment_method_id: String,
    pub created_at: NaiveDateTime,
}

impl TransactionRecord {
    pub fn is_successful(&self) -> bool {
        self.payment_status == STATUS_SUCCESS
    }

    pub fn is_failed(&self) -> bool {
        self.payment_status == STATUS_FAILED
    }

    pub fn is_app_transaction(&self) -> bool {
        self.source.eq_ignore_ascii_case("APP")
    }
}

/// A resolved reporting window. `end` is exclusive; `start`/`end` of `None`
/// mean an unbounded side (`period=all`).
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisPeriod {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub label: String,
}

impl AnalysisPeriod {
    /// Resolves query parameters into a concrete window.
    ///
    /// Explicit `start_date`/`end_date` (YYYY-MM-DD, end inclusive) win over
    /// `period`. Recognised periods: `today`, `yesterday`, `week` (7 days),
    /// `month` (30 days), `all`. With nothing supplied the window is
    /// yesterday..now. Malformed dates, reversed ranges and unknown period
    /// names are errors rather than silent fallbacks.
    pub fn resolve(
        period: Option<&str>,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        fn parse_day(s: &str) -> Result<NaiveDate, Box<dyn std::error::Error>> {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| format!("Invalid date '{}', expected YYYY-MM-DD", s).into())
        }

        let now = Utc::now().naive_utc();

        if start_date.is_some() || end_date.is_some() {
            let start = match start_date {
                Some(s) => parse_day(s)?,
                None => return Err("start_date is required when end_date is given".into()),
            };
            let end = match end_date {
                Some(s) => parse_day(s)?,
                None => return Err("end_date is required when start_date is given".into()),
            };
            if start > end {
                return Err(
                    format!("start_date {} is after end_date {}", start, end).into(),
                );
            }
            let start_dt = start.and_hms_opt(0, 0, 0).ok_or("invalid start date")?;
            let end_dt = (end + Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .ok_or("invalid end date")?;
            return Ok(AnalysisPeriod {
                start: Some(start_dt),
                end: Some(end_dt),
                label: "custom".to_string(),
            });
        }

        let (days_back, label) = match period.map(|p| p.trim().to_lowercase()) {
            None => (1, "yesterday".to_string()),
            Some(p) => match p.as_str() {
                "" => (1, "yesterday".to_string()),
                "today" => (0, "today".to_string()),
                "yesterday" => (1, "yesterday".to_string()),
                "week" => (7, "week".to_string()),
                "month" => (30, "month".to_string()),
                "all" => {
                    return Ok(AnalysisPeriod {
                        start: None,
                        end: None,
                        label: "all".to_string(),
                    })
                }
                other => {
                    return Err(format!(
                        "Unknown period '{}', expected today|yesterday|week|month|all",
                        other
                    )
                    .into())
                }
            },
        };

        let start = if days_back == 0 {
            now.date().and_hms_opt(0, 0, 0).ok_or("invalid date")?
        } else {
            now - Duration::days(days_back)
        };

        Ok(AnalysisPeriod {
            start: Some(start),
            end: Some(now),
            label,
        })
    }

    /// Number of whole days spanned by the window, never less than 1 for a
    /// bounded window. Unbounded (`all`) windows report 0.
    pub fn total_days(&self) -> i64 {
        match (self.start, self.end) {
            (Some(s), Some(e)) => {
                let days = (e - s).num_days();
                if days < 1 {
                    1
                } else {
                    days
                }
            }
            _ => 0,
        }
    }

    /// The adjacent previous window of equal length, used for period-over-period
    /// comparison. Unbounded windows have no previous window.
    pub fn previous(&self) -> Option<AnalysisPeriod> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(AnalysisPeriod {
                start: Some(s - (e - s)),
                end: Some(s),
                label: format!("previous_{}", self.label),
            }),
            _ => None,
        }
    }

    /// SQL filter for this window, prefixed with ` AND` so it can be appended
    /// to an existing WHERE clause. Dates are rendered from validated chrono
    /// values, never from raw user input.
    pub fn sql_filter(&self) -> String {
        let mut clause = String::new();
        if let Some(start) = self.start {
            clause.push_str(&format!(
                " AND created_at >= '{}'",
                start.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        if let Some(end) = self.end {
            clause.push_str(&format!(
                " AND created_at < '{}'",
                end.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        clause
    }

    pub fn start_string(&self) -> String {
        match self.start {
            Some(s) => s.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "beginning".to_string(),
        }
    }

    pub fn end_string(&self) -> String {
        match self.end {
            Some(e) => e.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "now".to_string(),
        }
    }
}

/// Parses a raw `(headers, rows)` result set into typed transaction records.
///
/// Schema validation happens here: a result set missing any required column is
/// rejected outright. Individual rows with an unparseable timestamp or an
/// empty customer id are dropped with a warning, matching the platform's
/// long-standing "coerce, never crash" treatment of dirty rows; numeric
/// fields that fail to parse become 0.
pub fn parse_transactions(
    headers: &[String],
    rows: &[Vec<String>],
) -> Result<Vec<TransactionRecord>, Box<dyn std::error::Error>> {
    const REQUIRED: [&str; 11] = [
        "id",
        "station_id",
        "motorcyclist_id",
        "source",
        "fuel_type",
        "liter",
        "pump_price",
        "amount",
        "payment_status",
        "payment_method_id",
        "created_at",
    ];

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut index = std::collections::HashMap::new();
    for (i, h) in headers.iter().enumerate() {
        index.insert(h.as_str(), i);
    }
    let missing: Vec<&str> = REQUIRED
        .iter()
        .filter(|c| !index.contains_key(**c))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(format!(
            "Transaction result set is missing required columns: {}",
            missing.join(", ")
        )
        .into());
    }

    fn field<'a>(row: &'a [String], idx: usize) -> &'a str {
        row.get(idx).map(|s| s.as_str()).unwrap_or("")
    }

    fn numeric(row: &[String], idx: usize) -> f64 {
        field(row, idx).parse::<f64>().unwrap_or(0.0)
    }

    let mut records = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for row in rows {
        let customer = field(row, index["motorcyclist_id"]).to_string();
        let created = NaiveDateTime::parse_from_str(
            field(row, index["created_at"]),
            "%Y-%m-%d %H:%M:%S%.f",
        );
        let created_at = match created {
            Ok(ts) if !customer.is_empty() && customer != "NULL" => ts,
            _ => {
                dropped += 1;
                continue;
            }
        };
        records.push(TransactionRecord {
            id: field(row, index["id"]).parse::<u64>().unwrap_or(0),
            station_id: field(row, index["station_id"]).to_string(),
            motorcyclist_id: customer,
            source: field(row, index["source"]).to_string(),
            fuel_type: field(row, index["fuel_type"]).to_string(),
            liter: numeric(row, index["liter"]),
            pump_price: numeric(row, index["pump_price"]),
            amount: numeric(row, index["amount"]),
            payment_status: field(row, index["payment_status"])
                .parse::<i32>()
                .unwrap_or(0),
            payment_method_id: field(row, index["payment_method_id"]).to_string(),
            created_at,
        });
    }
    if dropped > 0 {
        log::warn!(
            "Dropped {} transaction rows with missing customer id or timestamp",
            dropped
        );
    }

    Ok(records)
}

/// Represents a database connection manager for handling analytics reads
pub struct DbConnect;

/// Implementation block for DbConnect, providing methods for database interactions
impl DbConnect {
    /// Executes a read-only SQL query against the MySQL payments database and
    /// returns the results or an error
    ///
    /// ```
    /// use jalikoi_analytics::config_utils::DbConfig;
    /// use jalikoi_analytics::db_utils::DbConnect;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let config = DbConfig::from_env();
    ///     let (headers, rows) = DbConnect::execute_mysql_query(
    ///         &config,
    ///         "SELECT COUNT(*) AS total FROM DailyTransactionPayments",
    ///     )
    ///     .await
    ///     .expect("query failed");
    ///     println!("{:?} {:?}", headers, rows);
    /// }
    /// ```
    pub async fn execute_mysql_query(
        config: &DbConfig,
        sql_query: &str,
    ) -> Result<(Vec<String>, Vec<Vec<String>>), Box<dyn std::error::Error>> {
        // Create an OptsBuilder instance and set the connection details
        let builder = OptsBuilder::default()
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .db_name(Some(config.database.clone()));

        // Create a pool with the constructed Opts
        let pool = Pool::new(builder);
        let mut conn = pool.get_conn().await?;

        // Perform the query
        let result: Vec<MySqlRow> = conn.query(sql_query).await?;

        // Process the result
        let mut headers = Vec::new();
        let mut data = Vec::new();

        if let Some(first_row) = result.first() {
            headers = first_row
                .columns_ref()
                .iter()
                .map(|col| col.name_str().to_string())
                .collect::<Vec<String>>();
        }

        for row in result {
            let row_data = (0..headers.len())
                .map(|i| match row.get_opt::<String, usize>(i) {
                    Some(Ok(value)) => value,
                    _ => String::from("NULL"),
                })
                .collect::<Vec<String>>();
            data.push(row_data);
        }

        drop(conn);
        pool.disconnect().await?;

        Ok((headers, data))
    }

    /// Cheap connectivity probe for health checks.
    pub async fn ping(config: &DbConfig) -> Result<(), Box<dyn std::error::Error>> {
        let _ = Self::execute_mysql_query(config, "SELECT 1").await?;
        Ok(())
    }

    /// Fetches the typed transaction rows for a reporting window, successes
    /// and failures both (the failure rate needs the failed rows).
    pub async fn fetch_transactions(
        config: &DbConfig,
        period: &AnalysisPeriod,
    ) -> Result<Vec<TransactionRecord>, Box<dyn std::error::Error>> {
        let sql_query = format!(
            "SELECT id, station_id, motorcyclist_id, source, fuel_type, liter, \
             pump_price, amount, payment_status, payment_method_id, created_at \
             FROM {} \
             WHERE payment_status IN ({}, {}){} \
             ORDER BY created_at",
            TRANSACTIONS_TABLE,
            STATUS_SUCCESS,
            STATUS_FAILED,
            period.sql_filter()
        );
        //dbg!(&sql_query);
        let (headers, rows) = Self::execute_mysql_query(config, &sql_query).await?;
        parse_transactions(&headers, &rows)
    }
}
