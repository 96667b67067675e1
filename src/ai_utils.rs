// ai_utils.rs
use crate::api_utils::ApiCallBuilder;
use crate::config_utils::{DbConfig, GroqConfig};
use crate::db_utils::{AnalysisPeriod, DbConnect, TransactionRecord};
use crate::insights_utils::daily_revenue_series;
use chrono::{Duration, Local};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;

/// Per-user history is trimmed to this many messages before every completion
/// so prompts stay bounded.
pub const HISTORY_LIMIT: usize = 10;

/// One stored turn of a user's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

lazy_static! {
    static ref CHAT_HISTORY: Mutex<HashMap<String, Vec<ChatMessage>>> =
        Mutex::new(HashMap::new());
}

/// Last `limit` stored messages for a user, oldest first.
pub fn chat_history(user_id: &str, limit: usize) -> Vec<ChatMessage> {
    let registry = CHAT_HISTORY.lock().unwrap();
    match registry.get(user_id) {
        Some(messages) => {
            let skip = messages.len().saturating_sub(limit);
            messages[skip..].to_vec()
        }
        None => Vec::new(),
    }
}

/// Appends a completed user/assistant exchange and trims the user's history
/// to [`HISTORY_LIMIT`] messages.
pub fn record_exchange(user_id: &str, user_message: &str, reply: &str) {
    let mut registry = CHAT_HISTORY.lock().unwrap();
    let messages = registry.entry(user_id.to_string()).or_default();
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: user_message.to_string(),
    });
    messages.push(ChatMessage {
        role: "assistant".to_string(),
        content: reply.to_string(),
    });
    let overflow = messages.len().saturating_sub(HISTORY_LIMIT);
    if overflow > 0 {
        messages.drain(..overflow);
    }
}

/// Conversational interface over the payments database, backed by the Groq
/// chat-completions API with function calling. Tool phases are request
/// scoped; only user and assistant text turns are kept in the history
/// registry, so a trimmed history never strands a dangling tool message.
pub struct GroqChatbot {
    groq: GroqConfig,
    db: DbConfig,
}

impl GroqChatbot {
    pub fn new(groq: GroqConfig, db: DbConfig) -> Self {
        GroqChatbot { groq, db }
    }

    pub fn is_configured(&self) -> bool {
        self.groq.is_configured()
    }

    fn system_prompt() -> String {
        let today = Local::now().format("%Y-%m-%d");
        let yesterday = (Local::now() - Duration::days(1)).format("%Y-%m-%d");
        format!(
            "You are an AI assistant for Jalikoi Analytics, a fuel station analytics platform in Rwanda.\n\
             \n\
             Today's date is: {today}\n\
             Yesterday's date was: {yesterday}\n\
             \n\
             You help users understand their business data by answering questions about:\n\
             - Revenue and sales (always display amounts in RWF - Rwandan Francs)\n\
             - Customer statistics\n\
             - Station performance\n\
             - Transaction trends\n\
             - Business insights\n\
             \n\
             IMPORTANT: All monetary amounts are in RWF (Rwandan Francs), not dollars.\n\
             When displaying amounts, always use \"RWF\" or \"Rwandan Francs\", never use \"$\" or \"dollars\".\n\
             \n\
             Format large numbers with commas for readability (e.g., 15,234,567 RWF).\n\
             \n\
             When interpreting dates:\n\
             - \"today\" = {today}\n\
             - \"yesterday\" = {yesterday}\n\
             - \"last week\" = last 7 days ending today\n\
             - \"last 30 days\" = 30 days before today\n\
             \n\
             Always use the correct dates based on today's date shown above.\n\
             \n\
             When users ask questions, call the appropriate function to get real data.\n\
             Be conversational, helpful, and provide actionable insights.\n\
             Keep responses concise but informative."
        )
    }

    fn tool_definitions() -> Value {
        json!([
            {
                "type": "function",
                "function": {
                    "name": "get_database_stats",
                    "description": "Get overall statistics including revenue (in RWF), transactions, customers for a date range. Defaults to last 30 days if dates not provided. All amounts are in Rwandan Francs (RWF).",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "start_date": {
                                "type": "string",
                                "description": "Start date in YYYY-MM-DD format. Optional, defaults to 30 days ago."
                            },
                            "end_date": {
                                "type": "string",
                                "description": "End date in YYYY-MM-DD format. Optional, defaults to today."
                            }
                        }
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": "get_top_customers",
                    "description": "Get top customers ranked by revenue in RWF (Rwandan Francs). Defaults to last 30 days.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "start_date": {
                                "type": "string",
                                "description": "Start date in YYYY-MM-DD format. Optional."
                            },
                            "end_date": {
                                "type": "string",
                                "description": "End date in YYYY-MM-DD format. Optional."
                            },
                            "n": {
                                "type": "integer",
                                "description": "Number of top customers to return",
                                "default": 5
                            }
                        }
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": "get_station_performance",
                    "description": "Get performance metrics for all stations including revenue in RWF. Defaults to last 30 days.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "start_date": {
                                "type": "string",
                                "description": "Start date in YYYY-MM-DD format. Optional."
                            },
                            "end_date": {
                                "type": "string",
                                "description": "End date in YYYY-MM-DD format. Optional."
                            }
                        }
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": "get_revenue_trend",
                    "description": "Get daily revenue trend in RWF (Rwandan Francs) over time. Defaults to last 30 days.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "days": {
                                "type": "integer",
                                "description": "Number of days to analyze",
                                "default": 30
                            }
                        }
                    }
                }
            }
        ])
    }

    /// Fetches successful transactions for an explicit or defaulted (last 30
    /// days) window.
    async fn fetch_window(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Vec<TransactionRecord>, Box<dyn Error>> {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let month_ago = (Local::now() - Duration::days(30))
            .format("%Y-%m-%d")
            .to_string();
        let start = start_date.unwrap_or(&month_ago);
        let end = end_date.unwrap_or(&today);
        let period = AnalysisPeriod::resolve(None, Some(start), Some(end))?;
        let transactions = DbConnect::fetch_transactions(&self.db, &period).await?;
        Ok(transactions
            .into_iter()
            .filter(|t| t.is_successful())
            .collect())
    }

    async fn get_database_stats(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Value, Box<dyn Error>> {
        let transactions = self.fetch_window(start_date, end_date).await?;
        if transactions.is_empty() {
            return Ok(json!({"error": "No data available"}));
        }
        let total_revenue: f64 = transactions.iter().map(|t| t.amount).sum();
        let total_liters: f64 = transactions.iter().map(|t| t.liter).sum();
        let mut customers: Vec<&str> = transactions
            .iter()
            .map(|t| t.motorcyclist_id.as_str())
            .collect();
        customers.sort_unstable();
        customers.dedup();
        let mut stations: Vec<&str> = transactions
            .iter()
            .map(|t| t.station_id.as_str())
            .collect();
        stations.sort_unstable();
        stations.dedup();
        Ok(json!({
            "total_revenue": total_revenue,
            "total_transactions": transactions.len(),
            "total_customers": customers.len(),
            "total_liters": total_liters,
            "avg_transaction": total_revenue / transactions.len() as f64,
            "active_stations": stations.len(),
            "date_range": {
                "start": start_date.map(|s| s.to_string())
                    .unwrap_or_else(|| (Local::now() - Duration::days(30)).format("%Y-%m-%d").to_string()),
                "end": end_date.map(|s| s.to_string())
                    .unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string()),
            }
        }))
    }

    async fn get_top_customers(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
        n: usize,
    ) -> Result<Value, Box<dyn Error>> {
        let transactions = self.fetch_window(start_date, end_date).await?;
        if transactions.is_empty() {
            return Ok(json!({"error": "No data available"}));
        }
        let mut revenue_by_customer: HashMap<&str, f64> = HashMap::new();
        for t in &transactions {
            *revenue_by_customer
                .entry(t.motorcyclist_id.as_str())
                .or_insert(0.0) += t.amount;
        }
        let mut ranked: Vec<(&str, f64)> = revenue_by_customer.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n);
        Ok(json!({
            "top_customers": ranked
                .into_iter()
                .enumerate()
                .map(|(i, (customer_id, revenue))| json!({
                    "customer_id": customer_id,
                    "revenue": revenue,
                    "rank": i + 1,
                }))
                .collect::<Vec<_>>()
        }))
    }

    async fn get_station_performance(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Value, Box<dyn Error>> {
        let transactions = self.fetch_window(start_date, end_date).await?;
        if transactions.is_empty() {
            return Ok(json!({"error": "No data available"}));
        }
        let mut by_station: HashMap<&str, (u64, f64, f64)> = HashMap::new();
        for t in &transactions {
            let entry = by_station.entry(t.station_id.as_str()).or_insert((0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += t.amount;
            entry.2 += t.liter;
        }
        let mut stations: Vec<Value> = by_station
            .into_iter()
            .map(|(station_id, (count, revenue, liters))| {
                json!({
                    "station_id": station_id,
                    "revenue": revenue,
                    "transactions": count,
                    "avg_transaction": revenue / count as f64,
                    "total_liters": liters,
                })
            })
            .collect();
        stations.sort_by(|a, b| {
            b["revenue"]
                .as_f64()
                .partial_cmp(&a["revenue"].as_f64())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        stations.truncate(10);
        Ok(json!({ "stations": stations }))
    }

    async fn get_revenue_trend(&self, days: i64) -> Result<Value, Box<dyn Error>> {
        let start = (Local::now() - Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let transactions = self.fetch_window(Some(&start), None).await?;
        if transactions.is_empty() {
            return Ok(json!({"error": "No data available"}));
        }
        let daily = daily_revenue_series(&transactions);
        Ok(json!({
            "trend": daily
                .iter()
                .map(|d| json!({"date": d.date, "revenue": d.revenue}))
                .collect::<Vec<_>>()
        }))
    }

    /// Dispatches one tool call. Tool failures become an error object in the
    /// tool result, never a failed chat.
    async fn execute_tool(&self, name: &str, args: &Value) -> Value {
        let start_date = args.get("start_date").and_then(|v| v.as_str());
        let end_date = args.get("end_date").and_then(|v| v.as_str());
        let result = match name {
            "get_database_stats" => self.get_database_stats(start_date, end_date).await,
            "get_top_customers" => {
                let n = args.get("n").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
                self.get_top_customers(start_date, end_date, n).await
            }
            "get_station_performance" => {
                self.get_station_performance(start_date, end_date).await
            }
            "get_revenue_trend" => {
                let days = args.get("days").and_then(|v| v.as_i64()).unwrap_or(30);
                self.get_revenue_trend(days).await
            }
            _ => Ok(json!({"error": "Unknown function"})),
        };
        match result {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Chatbot tool {} failed: {}", name, e);
                json!({"error": format!("Tool execution failed: {}", e)})
            }
        }
    }

    async fn completion(&self, payload: Value) -> Result<Value, Box<dyn Error>> {
        let api_key = self
            .groq
            .api_key
            .as_deref()
            .ok_or("GROQ_API_KEY is not set")?;
        let headers = json!({
            "Content-Type": "application/json",
            "Authorization": format!("Bearer {}", api_key)
        });
        let response = ApiCallBuilder::call("POST", &self.groq.api_url, Some(headers), Some(payload))
            .retries(3, 2)
            .execute()
            .await?;
        Ok(serde_json::from_str(&response)?)
    }

    /// One full exchange: completion with tools offered, tool execution
    /// against the live database, then a second completion for the reply.
    pub async fn chat(
        &self,
        user_message: &str,
        user_id: &str,
    ) -> Result<String, Box<dyn Error>> {
        let system_prompt = Self::system_prompt();
        let mut messages: Vec<Value> =
            vec![json!({"role": "system", "content": system_prompt})];
        for m in chat_history(user_id, HISTORY_LIMIT) {
            messages.push(json!({"role": m.role, "content": m.content}));
        }
        messages.push(json!({"role": "user", "content": user_message}));

        let first = self
            .completion(json!({
                "model": self.groq.model,
                "messages": messages,
                "tools": Self::tool_definitions(),
                "tool_choice": "auto",
                "max_tokens": 1024,
                "temperature": 0.7,
            }))
            .await?;
        let first_message = first["choices"][0]["message"].clone();

        let reply = match first_message["tool_calls"].as_array().filter(|c| !c.is_empty()) {
            Some(tool_calls) => {
                messages.push(first_message.clone());
                for call in tool_calls {
                    let name = call["function"]["name"].as_str().unwrap_or("");
                    let args: Value = call["function"]["arguments"]
                        .as_str()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| json!({}));
                    log::info!("Chatbot tool call: {}({})", name, args);
                    let result = self.execute_tool(name, &args).await;
                    messages.push(json!({
                        "tool_call_id": call["id"],
                        "role": "tool",
                        "name": name,
                        "content": result.to_string(),
                    }));
                }
                let second = self
                    .completion(json!({
                        "model": self.groq.model,
                        "messages": messages,
                        "max_tokens": 1024,
                        "temperature": 0.7,
                    }))
                    .await?;
                second["choices"][0]["message"]["content"]
                    .as_str()
                    .ok_or("No content in chat completion")?
                    .to_string()
            }
            None => first_message["content"]
                .as_str()
                .ok_or("No content in chat completion")?
                .to_string(),
        };

        record_exchange(user_id, user_message, &reply);
        Ok(reply)
    }
}
