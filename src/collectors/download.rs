//! Retrying HTTP downloader for feed collectors.
//!
//! Retries transient failures (transport errors, 5xx) with a fixed
//! sleep between attempts until a total deadline is exceeded; 4xx
//! responses are treated as non-retryable. Captures the response's
//! `Last-Modified` header, recognizing the three date forms of
//! RFC 7231 section 7.1.1.1.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::time::Instant;
use tracing::{error, warn};

use super::{CollectorError, Result};

/// Date/time formats allowed in HTTP applications (RFC 7231 7.1.1.1).
const HTTP_DATETIME_FORMATS: [&str; 3] = [
    // the preferred format
    "%a, %d %b %Y %H:%M:%S GMT",
    "%A, %d-%b-%y %H:%M:%S GMT",
    // asctime; %e copes with non-zero-padded days
    "%a %b %e %H:%M:%S %Y",
];

const HTTP_LAST_MODIFIED_HEADER: &str = "last-modified";

/// Per-download parameters.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub url: String,
    /// Total budget for all attempts.
    pub download_timeout: Duration,
    /// Sleep between attempts.
    pub retry_timeout: Duration,
    /// Optional HTTP basic-auth credentials.
    pub auth: Option<(String, String)>,
    /// Optional form fields; their presence turns the request into POST.
    pub form_data: Option<HashMap<String, String>>,
    /// Headers sent with every request.
    pub base_request_headers: HashMap<String, String>,
}

impl DownloadConfig {
    pub fn new(url: impl Into<String>, download_timeout: Duration, retry_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            download_timeout,
            retry_timeout,
            auth: None,
            form_data: None,
            base_request_headers: HashMap::new(),
        }
    }
}

/// Parse one HTTP date header value, trying all RFC 7231 forms.
pub fn parse_http_datetime(raw: &str) -> Option<DateTime<Utc>> {
    for format in HTTP_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw.trim(), format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// HTTP downloader with a retry budget and `Last-Modified` capture.
pub struct UrlDownloader {
    client: reqwest::Client,
    config: DownloadConfig,
    http_last_modified: Option<DateTime<Utc>>,
}

impl UrlDownloader {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CollectorError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            http_last_modified: None,
        })
    }

    /// `Last-Modified` of the most recent successful download.
    pub fn http_last_modified(&self) -> Option<DateTime<Utc>> {
        self.http_last_modified
    }

    /// Download the configured URL, retrying until the deadline.
    pub async fn download(&mut self) -> Result<Vec<u8>> {
        self.http_last_modified = None;
        let started = Instant::now();
        loop {
            match self.attempt().await {
                Ok(bytes) => return Ok(bytes),
                Err(Attempt::NonRetryable(message)) => {
                    error!(url = %self.config.url, %message, "download failed (non-retryable)");
                    return Err(CollectorError::Download {
                        url: self.config.url.clone(),
                        message,
                    });
                }
                Err(Attempt::Retryable(message)) => {
                    if started.elapsed() >= self.config.download_timeout {
                        error!(url = %self.config.url, "download deadline exceeded");
                        return Err(CollectorError::DownloadDeadline {
                            url: self.config.url.clone(),
                        });
                    }
                    warn!(
                        url = %self.config.url,
                        %message,
                        sleep_secs = self.config.retry_timeout.as_secs(),
                        "download attempt failed, sleeping before retry"
                    );
                    tokio::time::sleep(self.config.retry_timeout).await;
                }
            }
        }
    }

    async fn attempt(&mut self) -> std::result::Result<Vec<u8>, Attempt> {
        let mut request = match &self.config.form_data {
            Some(form) => self.client.post(&self.config.url).form(form),
            None => self.client.get(&self.config.url),
        };
        for (name, value) in &self.config.base_request_headers {
            request = request.header(name, value);
        }
        if let Some((user, password)) = &self.config.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(Attempt::NonRetryable(format!("HTTP status {}", status)));
        }
        if !status.is_success() {
            return Err(Attempt::Retryable(format!("HTTP status {}", status)));
        }

        let last_modified = response
            .headers()
            .get(HTTP_LAST_MODIFIED_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_datetime);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Attempt::Retryable(e.to_string()))?;

        self.http_last_modified = last_modified;
        Ok(bytes.to_vec())
    }
}

enum Attempt {
    Retryable(String),
    NonRetryable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_datetime_all_rfc7231_forms() {
        let expected = "2019-07-10 02:15:00";
        for raw in [
            "Wed, 10 Jul 2019 02:15:00 GMT",
            "Wednesday, 10-Jul-19 02:15:00 GMT",
            "Wed Jul 10 02:15:00 2019",
        ] {
            let parsed = parse_http_datetime(raw).unwrap();
            assert_eq!(
                parsed.format("%Y-%m-%d %H:%M:%S").to_string(),
                expected,
                "input: {raw}"
            );
        }
        // asctime with a non-zero-padded day
        assert!(parse_http_datetime("Wed Jul  3 02:15:00 2019").is_some());
    }

    #[test]
    fn test_parse_http_datetime_rejects_garbage() {
        assert!(parse_http_datetime("yesterday-ish").is_none());
        assert!(parse_http_datetime("").is_none());
    }
}
