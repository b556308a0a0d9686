//! Downloads with bounded retries and exponential backoff.

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{TransientFetchError, is_transient};

pub const FETCH_ATTEMPTS: u32 = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("sandwright/", env!("CARGO_PKG_VERSION"));

/// Run `op` up to `attempts` times, sleeping `2^attempt + jitter` seconds
/// between tries. Only transient failures are retried; the last one is
/// returned once attempts run out.
pub fn retry<T>(
    attempts: u32,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut last_error = None;
    for attempt in 0..attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) => {
                if attempt + 1 < attempts {
                    let delay = backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch:retrying"
                    );
                    sleep(delay);
                }
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("No fetch attempts were made")))
}

/// `2^attempt` seconds plus up to one second of random jitter.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16)) + Duration::from_secs_f64(jitter())
}

/// Uniform in `[0, 1)`. Falls back to no jitter if the OS has no entropy.
fn jitter() -> f64 {
    let mut bytes = [0u8; 8];
    match getrandom::fill(&mut bytes) {
        Ok(()) => (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => 0.0,
    }
}

pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Downloads a URL to a file, retrying transient network failures.
pub struct RetryingFetcher {
    client: Client,
    attempts: u32,
}

impl RetryingFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(http_client()?))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            attempts: FETCH_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Download `url` to `dest`, replacing it. Returns the number of bytes.
    pub fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        debug!(url, dest = %dest.display(), "fetch:start");
        let written = retry(self.attempts, std::thread::sleep, |_| {
            self.fetch_once(url, dest)
        })?;
        debug!(url, bytes = written, "fetch:done");
        Ok(written)
    }

    fn fetch_once(&self, url: &str, dest: &Path) -> Result<u64> {
        let transient = |reason: String| TransientFetchError {
            url: url.to_string(),
            reason,
        };

        let mut response = self.client.get(url).send().map_err(|e| {
            if is_transient_send_error(&e) {
                anyhow::Error::from(transient(e.to_string()))
            } else {
                anyhow!("Failed to fetch {url}: {e}")
            }
        })?;
        let status = response.status();
        if is_retryable_status(status) {
            return Err(transient(format!("server responded {status}")).into());
        }
        if !status.is_success() {
            return Err(anyhow!("Failed to fetch {url}: server responded {status}"));
        }

        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;

        let mut written: u64 = 0;
        let mut buffer = vec![0_u8; 64 * 1024];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|e| transient(format!("stream error: {e}")))?;
            if read == 0 {
                break;
            }
            tmp.write_all(&buffer[..read])
                .with_context(|| format!("Failed to write download for {url}"))?;
            written += read as u64;
        }

        tmp.persist(dest)
            .with_context(|| format!("Failed to save download to {}", dest.display()))?;
        Ok(written)
    }
}

/// Connection, timeout and transport failures may clear up; malformed
/// requests and redirect loops will not.
fn is_transient_send_error(err: &reqwest::Error) -> bool {
    if err.is_builder() || err.is_redirect() {
        return false;
    }
    err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}
