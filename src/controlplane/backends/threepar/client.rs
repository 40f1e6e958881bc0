//! SAN array transport
//!
//! Owns the HTTP client, the session key and the retry policy. Every call
//! goes through [`SanClient::send`], which transparently re-authenticates
//! on an expired session and backs off while the array reports busy, both
//! bounded by attempt counters. Session refreshes are serialized: a caller
//! only logs in again if nobody refreshed the key since it was read.

use super::types::*;
use crate::domain::model::BackendCluster;
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Randomized delay window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Constant-mean backoff whose samples stay within `[min, max]`
    pub fn backoff(&self) -> ExponentialBackoff {
        let min = self.min_ms as f64;
        let max = self.max_ms.max(self.min_ms) as f64;
        let mid = (min + max) / 2.0;
        let spread = if max + min > 0.0 { (max - min) / (max + min) } else { 0.0 };

        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(mid as u64))
            .with_randomization_factor(spread)
            .with_multiplier(1.0)
            .with_max_interval(Duration::from_millis(max as u64))
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanClientConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Re-authentications allowed within one call
    pub max_reauth: u32,
    /// Busy answers tolerated within one call
    pub max_busy_retries: u32,
    pub busy_backoff: DelayRange,
    /// Delay before the first task status poll
    pub task_first_poll_ms: u64,
    pub task_poll: DelayRange,
    /// Longest wait for one array task before giving up
    pub task_timeout_ms: u64,
    /// Fixed poll interval while promoting a virtual copy
    pub promote_poll_ms: u64,
}

impl Default for SanClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            connect_timeout_secs: 3,
            max_reauth: 3,
            max_busy_retries: 10,
            busy_backoff: DelayRange::new(1_000, 4_000),
            task_first_poll_ms: 1_000,
            task_poll: DelayRange::new(1_000, 10_000),
            task_timeout_ms: 6 * 3_600 * 1_000,
            promote_poll_ms: 1_000,
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// Array answer after session and busy handling
#[derive(Debug)]
pub struct SanResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    pub error: ErrorBody,
}

impl SanResponse {
    pub fn is(&self, status: u16) -> bool {
        self.status.as_u16() == status
    }

    pub fn code(&self) -> i64 {
        self.error.code
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn into_error(self) -> Error {
        Error::San {
            status: self.status.as_u16(),
            code: self.error.code,
            desc: self.error.desc,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Default)]
struct Session {
    key: Option<String>,
    generation: u64,
}

/// Session-authenticated WSAPI client for one array
pub struct SanClient {
    cluster_id: String,
    base_url: String,
    username: String,
    password: String,
    config: SanClientConfig,
    http: reqwest::Client,
    session: RwLock<Session>,
}

impl SanClient {
    /// Build a client for an array record; call [`authenticate`](Self::authenticate) before use
    pub fn new(cluster: &BackendCluster, config: SanClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            cluster_id: cluster.id.clone(),
            base_url: format!("http://{}/api/v1", cluster.mgmt_addr),
            username: cluster.username.clone(),
            password: cluster.password.clone(),
            config,
            http,
            session: RwLock::new(Session::default()),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn config(&self) -> &SanClientConfig {
        &self.config
    }

    /// Establish a fresh session
    pub async fn authenticate(&self) -> Result<()> {
        let key = self.login().await?;
        let mut session = self.session.write().await;
        session.key = Some(key);
        session.generation += 1;
        info!("Authenticated to SAN array {}", self.cluster_id);
        Ok(())
    }

    /// Release the session on the array
    pub async fn logout(&self) -> Result<()> {
        let key = self.session.write().await.key.take();
        let Some(key) = key else {
            return Ok(());
        };
        let url = format!("{}/credentials/{}", self.base_url, urlencoding::encode(&key));
        let resp = self.http.delete(&url).send().await?;
        if !resp.status().is_success() {
            warn!("Logout from {} answered HTTP {}", self.cluster_id, resp.status());
        }
        Ok(())
    }

    async fn login(&self) -> Result<String> {
        let url = format!("{}/credentials", self.base_url);
        debug!("Authenticating to {}", url);

        let resp = self
            .http
            .post(&url)
            .json(&Credentials {
                user: &self.username,
                password: &self.password,
            })
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status == StatusCode::CREATED {
            let key: SessionKey = serde_json::from_str(&body)?;
            return Ok(key.key);
        }

        let error: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        Err(Error::San {
            status: status.as_u16(),
            code: error.code,
            desc: format!("authentication failed: {}", error.desc),
        })
    }

    /// Log in again unless another caller already did since `seen` was read
    async fn refresh_session(&self, seen: u64) -> Result<()> {
        let mut session = self.session.write().await;
        if session.generation != seen {
            debug!("Session of {} already refreshed", self.cluster_id);
            return Ok(());
        }
        let key = self.login().await?;
        session.key = Some(key);
        session.generation += 1;
        info!("Re-authenticated to SAN array {}", self.cluster_id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn set_session_key(&self, key: &str) {
        self.session.write().await.key = Some(key.to_string());
    }

    /// Call the array, retrying busy answers
    pub async fn send(
        &self,
        request_id: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<SanResponse> {
        self.send_with(request_id, method, path, body, true).await
    }

    /// Call the array; with `retry_busy == false` busy answers are returned to the caller
    pub async fn send_with(
        &self,
        request_id: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        retry_busy: bool,
    ) -> Result<SanResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut reauths = 0u32;
        let mut busy = 0u32;
        let mut busy_delay = self.config.busy_backoff.backoff();

        loop {
            let (key, generation) = {
                let session = self.session.read().await;
                (session.key.clone(), session.generation)
            };

            let mut req = self.http.request(method.clone(), &url);
            if let Some(key) = key {
                req = req.header(SESSION_HEADER, key);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            debug!(request_id = %request_id, "{} {}", method, url);
            let resp = req.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let text = resp.text().await?;

            if status.is_success() {
                return Ok(SanResponse {
                    status,
                    headers,
                    body: text,
                    error: ErrorBody::default(),
                });
            }

            let error: ErrorBody = serde_json::from_str(&text).unwrap_or_default();

            if status == StatusCode::FORBIDDEN && error.code == codes::INVALID_SESSION {
                if reauths >= self.config.max_reauth {
                    return Err(Error::SanSessionExpired { attempts: reauths });
                }
                reauths += 1;
                warn!(
                    request_id = %request_id,
                    "Session expired on {}, re-authenticating ({}/{})",
                    self.cluster_id, reauths, self.config.max_reauth
                );
                self.refresh_session(generation).await?;
                continue;
            }

            if retry_busy && error.code == codes::SYSTEM_BUSY {
                if busy >= self.config.max_busy_retries {
                    return Err(Error::SanBusy { attempts: busy });
                }
                busy += 1;
                let delay = busy_delay
                    .next_backoff()
                    .unwrap_or(Duration::from_millis(self.config.busy_backoff.max_ms));
                debug!(
                    request_id = %request_id,
                    "Array {} busy, retrying {} {} in {:?}", self.cluster_id, method, path, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Ok(SanResponse {
                status,
                headers,
                body: text,
                error,
            });
        }
    }

    /// Current state of an array task; a busy array reads as still active
    pub async fn task(&self, request_id: &str, task_id: i64) -> Result<TaskStatus> {
        let resp = self
            .send_with(request_id, Method::GET, &format!("/tasks/{}", task_id), None, false)
            .await?;
        if resp.is(200) {
            return Ok(resp.json::<TaskInfo>()?.state());
        }
        if resp.code() == codes::SYSTEM_BUSY {
            return Ok(TaskStatus::Active);
        }
        Err(resp.into_error())
    }

    /// Poll a task until it leaves the active state or the task timeout passes
    pub async fn wait_for_task<F>(&self, request_id: &str, task_id: i64, first: Duration, mut next: F) -> Result<()>
    where
        F: FnMut() -> Duration + Send,
    {
        let limit = Duration::from_millis(self.config().task_timeout_ms);
        let started = std::time::Instant::now();
        let mut delay = first;
        loop {
            tokio::time::sleep(delay).await;
            match self.task(request_id, task_id).await? {
                TaskStatus::Done | TaskStatus::Cancelled => {
                    debug!(request_id = %request_id, "Task {} finished", task_id);
                    return Ok(());
                }
                TaskStatus::Failed => return Err(Error::SanTaskFailed { task_id }),
                TaskStatus::Active => {}
                TaskStatus::Unknown(code) => {
                    warn!(request_id = %request_id, "Task {} in unexpected state {}", task_id, code);
                }
            }
            if started.elapsed() >= limit {
                warn!(request_id = %request_id, "Giving up on task {} after {:?}", task_id, started.elapsed());
                return Err(Error::SanTaskTimeout {
                    task_id,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            delay = next();
        }
    }
}

/// Path segment escaping for object names
pub(crate) fn seg(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

#[cfg(test)]
pub(crate) fn test_config() -> SanClientConfig {
    SanClientConfig {
        request_timeout_secs: 5,
        connect_timeout_secs: 1,
        max_reauth: 2,
        max_busy_retries: 3,
        busy_backoff: DelayRange::new(1, 5),
        task_first_poll_ms: 1,
        task_poll: DelayRange::new(1, 5),
        task_timeout_ms: 2_000,
        promote_poll_ms: 1,
    }
}

#[cfg(test)]
pub(crate) fn test_cluster(host: &str) -> BackendCluster {
    BackendCluster {
        id: "array-1".into(),
        mgmt_addr: host.to_string(),
        controller_addrs: "10.0.0.11,10.0.0.12".into(),
        username: "admin".into(),
        password: "secret".into(),
        category: None,
    }
}
