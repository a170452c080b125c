use reqwest::Client;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use super::types::{FoodDetails, SearchFood, SearchResponse};
use crate::config::Config;

/// Rate-limited, retrying client for the FDC search and detail endpoints.
///
/// Transport errors never propagate: `search` degrades to an empty list and
/// `get_details` to `None` once retries are exhausted. The inter-request gate
/// is shared across concurrent callers, so the parallel tier fan-out still
/// honors the minimum delay.
pub struct FdcClient {
    client: Client,
    api_key: String,
    base_url: String,
    rate_limit_delay: Duration,
    max_retries: u32,
    timeout: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl FdcClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: config.usda_api_key.clone(),
            base_url: config.usda_base_url.trim_end_matches('/').to_string(),
            rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
            max_retries: config.max_retries.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            last_request: Mutex::new(None),
        }
    }

    /// Search for foods matching the query. `data_type_filter` of `None`
    /// searches every partition.
    pub async fn search(
        &self,
        query: &str,
        page_size: u32,
        data_type_filter: Option<&str>,
    ) -> Vec<SearchFood> {
        let url = format!("{}/foods/search", self.base_url);
        let page_size = page_size.min(200).to_string();
        let mut params = vec![
            ("query", query.to_string()),
            ("pageSize", page_size),
            ("api_key", self.api_key.clone()),
        ];
        if let Some(data_type) = data_type_filter {
            params.push(("dataType", data_type.to_string()));
        }

        for attempt in 0..self.max_retries {
            self.wait_for_rate_limit().await;
            let result = self
                .client
                .get(&url)
                .query(&params)
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.json::<SearchResponse>().await {
                        Ok(data) => return data.foods,
                        Err(e) => {
                            // Malformed payload counts as an empty result for this call.
                            eprintln!("Error parsing search response for '{}': {}", query, e);
                            return Vec::new();
                        }
                    }
                }
                Ok(response) => {
                    if attempt < self.max_retries - 1 {
                        let wait = backoff_delay(attempt);
                        println!(
                            "  HTTP {} searching for '{}', retrying in {}s...",
                            response.status(),
                            query,
                            wait.as_secs()
                        );
                        sleep(wait).await;
                    } else {
                        eprintln!(
                            "Error searching for '{}': HTTP {}",
                            query,
                            response.status()
                        );
                    }
                }
                Err(e) => {
                    if attempt < self.max_retries - 1 {
                        let wait = backoff_delay(attempt);
                        println!(
                            "  Error searching for '{}', retrying in {}s...",
                            query,
                            wait.as_secs()
                        );
                        sleep(wait).await;
                    } else {
                        eprintln!("Error searching for '{}': {}", query, e);
                    }
                }
            }
        }

        Vec::new()
    }

    /// Get the full detail record for a specific FDC ID.
    pub async fn get_details(&self, fdc_id: i64) -> Option<FoodDetails> {
        let url = format!("{}/food/{}", self.base_url, fdc_id);
        let params = [("api_key", self.api_key.clone())];

        for attempt in 0..self.max_retries {
            self.wait_for_rate_limit().await;
            let result = self
                .client
                .get(&url)
                .query(&params)
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    match response.json::<FoodDetails>().await {
                        Ok(details) => return Some(details),
                        Err(e) => {
                            eprintln!("    Error parsing detail record for FDC ID {}: {}", fdc_id, e);
                            return None;
                        }
                    }
                }
                Ok(response) => {
                    if attempt < self.max_retries - 1 {
                        let wait = backoff_delay(attempt);
                        println!(
                            "    HTTP {} fetching FDC ID {}, retrying in {}s...",
                            response.status(),
                            fdc_id,
                            wait.as_secs()
                        );
                        sleep(wait).await;
                    } else {
                        eprintln!(
                            "    Error fetching FDC ID {}: HTTP {}",
                            fdc_id,
                            response.status()
                        );
                    }
                }
                Err(e) => {
                    if attempt < self.max_retries - 1 {
                        let wait = backoff_delay(attempt);
                        println!(
                            "    Error fetching FDC ID {}, retrying in {}s...",
                            fdc_id,
                            wait.as_secs()
                        );
                        sleep(wait).await;
                    } else {
                        eprintln!("    Error fetching FDC ID {}: {}", fdc_id, e);
                    }
                }
            }
        }

        None
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit_delay {
                sleep(self.rate_limit_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt) * 2)
}
