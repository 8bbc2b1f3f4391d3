//! Authoritative data source
//!
//! Reloads always come from the backend's REST interface (PostgREST
//! conventions): `GET {url}/rest/v1/{table}?select=*&{filter}` with the
//! project `apikey` header and the session token as a bearer credential.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::types::{Domain, Record, Session};

/// Fetches the full current contents of a domain
#[async_trait]
pub trait DataSource: Send + Sync {
    /// All rows of `domain` visible to the current session, narrowed by `filter`
    async fn fetch_all(&self, domain: Domain, filter: Option<&str>) -> Result<Vec<Record>>;

    /// Switch the credentials used for later fetches
    fn set_session(&self, _session: Option<&Session>) {}
}

/// PostgREST client for the managed backend
pub struct RestDataSource {
    config: BackendConfig,
    http_client: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: RwLock<Option<String>>,
}

impl RestDataSource {
    /// Create a client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("backend.url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let anon_key = config
            .anon_key
            .clone()
            .ok_or_else(|| Error::Config("backend.anon_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(&anon_key)
                .map_err(|e| Error::Config(format!("invalid anon_key: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
            anon_key,
            access_token: RwLock::new(None),
        })
    }

    /// REST endpoint for a domain's table
    pub fn table_url(&self, domain: Domain, filter: Option<&str>) -> String {
        let mut url = format!(
            "{}/rest/v1/{}?select=*",
            self.base_url,
            urlencoding::encode(self.config.table_for(domain))
        );
        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            url.push('&');
            url.push_str(filter.trim_start_matches(['?', '&']));
        }
        url
    }

    fn bearer(&self) -> Result<HeaderValue> {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.anon_key.clone());
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Config(format!("invalid access token: {}", e)))
    }

    /// Single fetch without retries
    pub async fn fetch_once(&self, domain: Domain, filter: Option<&str>) -> Result<Vec<Record>> {
        let url = self.table_url(domain, filter);

        let response = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, self.bearer()?)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            let rows: Vec<Value> = response
                .json()
                .await
                .map_err(|e| Error::Backend(format!("failed to parse response: {}", e)))?;
            Ok(rows_to_records(domain, rows))
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(Error::Unauthenticated)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Backend(format!(
                "API error ({}): {}",
                status.as_u16(),
                error_text
            )))
        }
    }

    /// Fetch with retry logic
    ///
    /// Retries transient failures (5xx, 429, timeouts) with exponential backoff.
    pub async fn fetch_all_with_retry(
        &self,
        domain: Domain,
        filter: Option<&str>,
    ) -> Result<Vec<Record>> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    domain = %domain,
                    "Retrying fetch (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.config.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            match self.fetch_once(domain, filter).await {
                Ok(records) => return Ok(records),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!(domain = %domain, "Transient error fetching rows: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Backend("max retries exceeded".to_string())))
    }

    /// Check if the backend answers at all
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/rest/v1/", self.base_url);

        let request = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, self.bearer()?);
        match request.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl DataSource for RestDataSource {
    async fn fetch_all(&self, domain: Domain, filter: Option<&str>) -> Result<Vec<Record>> {
        self.fetch_all_with_retry(domain, filter).await
    }

    fn set_session(&self, session: Option<&Session>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            session.map(|session| session.access_token.clone());
    }
}

fn rows_to_records(domain: Domain, rows: Vec<Value>) -> Vec<Record> {
    let total = rows.len();
    let records: Vec<Record> = rows.into_iter().filter_map(Record::from_row).collect();
    if records.len() < total {
        tracing::warn!(
            domain = %domain,
            skipped = total - records.len(),
            "Skipped rows without a usable id"
        );
    }
    records
}

/// Check if an error is retryable (transient)
fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Backend(msg) => {
            msg.starts_with("API error (5")
                || msg.starts_with("API error (429)")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("request failed")
        }
        _ => false,
    }
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Domain, Vec<Record>>,
    failures: usize,
    fetches: HashMap<Domain, usize>,
    delay: Duration,
}

/// In-memory data source with failure injection
#[derive(Default)]
pub struct MemoryDataSource {
    state: Mutex<MemoryState>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the rows served for `domain`
    pub fn set(&self, domain: Domain, records: Vec<Record>) {
        self.lock().tables.insert(domain, records);
    }

    /// Make the next `count` fetches fail
    pub fn fail_next(&self, count: usize) {
        self.lock().failures = count;
    }

    /// Delay every fetch
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Number of fetches made for `domain`, failed ones included
    pub fn fetch_count(&self, domain: Domain) -> usize {
        self.lock().fetches.get(&domain).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn fetch_all(&self, domain: Domain, _filter: Option<&str>) -> Result<Vec<Record>> {
        let delay = {
            let mut state = self.lock();
            *state.fetches.entry(domain).or_default() += 1;
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(Error::Backend("API error (503): unavailable".to_string()));
        }
        Ok(state.tables.get(&domain).cloned().unwrap_or_default())
    }
}
