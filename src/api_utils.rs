// api_utils.rs
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value as JsonValue};
use std::error::Error as StdError;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

/// Small builder around reqwest for the JSON APIs this service talks to
/// (currently the Groq chat-completions endpoint), with bounded retries.
pub struct ApiCallBuilder {
    method: String,
    url: String,
    header_option: Option<JsonValue>,
    payload: Option<JsonValue>,
    retry_count: usize,
    retry_timeout: u64,
}

impl ApiCallBuilder {
    pub fn call(
        method: &str,
        url: &str,
        header_option: Option<JsonValue>,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            method: method.to_uppercase(),
            url: url.to_string(),
            header_option,
            payload,
            retry_count: 0,
            retry_timeout: 1,
        }
    }

    pub fn retries(mut self, count: usize, timeout: u64) -> Self {
        self.retry_count = count;
        self.retry_timeout = timeout;
        self
    }

    pub async fn execute(self) -> Result<String, Box<dyn StdError>> {
        async fn try_execute(request_builder: RequestBuilder) -> Result<String, Box<dyn StdError>> {
            let response: Response = request_builder
                .send()
                .await
                .map_err(|e| Box::new(e) as Box<dyn StdError>)?;

            if response.status().is_success() {
                let response_text = response
                    .text()
                    .await
                    .map_err(|e| Box::new(e) as Box<dyn StdError>)?;
                Ok(response_text)
            } else {
                Err(Box::new(response.error_for_status().unwrap_err()) as Box<dyn StdError>)
            }
        }

        let mut attempts = 0;

        loop {
            let reqwest_method = match self.method.as_str() {
                "GET" => reqwest::Method::GET,
                "POST" => reqwest::Method::POST,
                _ => {
                    return Err(Box::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "Invalid HTTP method",
                    )))
                }
            };

            let client = Client::new();
            let mut request_builder = client.request(reqwest_method, &self.url);

            if let Some(ref header_json) = self.header_option {
                let mut header_map = HeaderMap::new();
                for (k, v) in header_json.as_object().unwrap_or(&Map::new()) {
                    let header_name = HeaderName::from_str(k)?;
                    let header_value = HeaderValue::from_str(v.as_str().unwrap_or_default())?;
                    header_map.insert(header_name, header_value);
                }
                request_builder = request_builder.headers(header_map);
            }

            if self.method == "POST" {
                if let Some(ref payload_json) = self.payload {
                    request_builder = request_builder.json(payload_json);
                }
            }

            //dbg!(&request_builder);

            match try_execute(request_builder).await {
                Ok(response_text) => return Ok(response_text),
                Err(e) if attempts < self.retry_count => {
                    log::warn!(
                        "API call failed: {}. Retrying in {} seconds...",
                        e,
                        self.retry_timeout
                    );
                    sleep(Duration::from_secs(self.retry_timeout)).await;
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
