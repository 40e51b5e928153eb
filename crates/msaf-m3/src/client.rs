//! M3 HTTP client for one application server.

use std::time::Duration;

use serde_json::Value;

pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// How an M3 request ended. The reconciler treats transport failures
/// and 5xx as retriable; any other non-success status is dropped.
#[derive(Debug, thiserror::Error)]
pub enum M3Error {
    #[error("application server returned status {0}")]
    Status(u16),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl M3Error {
    pub fn retriable(&self) -> bool {
        match self {
            Self::Status(code) => *code >= 500,
            Self::Transport(_) => true,
        }
    }
}

impl From<reqwest::Error> for M3Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Client for the `/3gpp-m3/v1` surface of one application server.
#[derive(Debug, Clone)]
pub struct M3Client {
    http: reqwest::Client,
    base: String,
}

impl M3Client {
    pub fn new(canonical_hostname: &str, m3_port: u16, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: format!("http://{canonical_hostname}:{m3_port}/3gpp-m3/v1"),
        }
    }

    fn check(status: reqwest::StatusCode) -> Result<(), M3Error> {
        if status.is_success() {
            Ok(())
        } else {
            Err(M3Error::Status(status.as_u16()))
        }
    }

    /// GET /certificates: the AF-unique ids the server already holds.
    pub async fn list_certificates(&self) -> Result<Vec<String>, M3Error> {
        let response = self
            .http
            .get(format!("{}/certificates", self.base))
            .send()
            .await?;
        Self::check(response.status())?;
        Ok(response.json().await?)
    }

    /// GET /content-hosting-configurations: provisioning session ids the
    /// server already mirrors.
    pub async fn list_content_hosting_configurations(&self) -> Result<Vec<String>, M3Error> {
        let response = self
            .http
            .get(format!("{}/content-hosting-configurations", self.base))
            .send()
            .await?;
        Self::check(response.status())?;
        Ok(response.json().await?)
    }

    /// Pushes a certificate: PUT when the server already has the id,
    /// POST otherwise.
    pub async fn upsert_certificate(
        &self,
        af_unique_id: &str,
        pem: String,
        exists: bool,
    ) -> Result<(), M3Error> {
        let url = format!("{}/certificates/{af_unique_id}", self.base);
        let request = if exists {
            self.http.put(url)
        } else {
            self.http.post(url)
        };
        let response = request
            .header(reqwest::header::CONTENT_TYPE, PEM_CONTENT_TYPE)
            .body(pem)
            .send()
            .await?;
        Self::check(response.status())
    }

    /// Pushes a content hosting configuration, keyed by session id.
    pub async fn upsert_content_hosting_configuration(
        &self,
        provisioning_session_id: &str,
        document: &Value,
        exists: bool,
    ) -> Result<(), M3Error> {
        let url = format!(
            "{}/content-hosting-configurations/{provisioning_session_id}",
            self.base
        );
        let request = if exists {
            self.http.put(url)
        } else {
            self.http.post(url)
        };
        let response = request.json(document).send().await?;
        Self::check(response.status())
    }

    pub async fn delete_certificate(&self, af_unique_id: &str) -> Result<(), M3Error> {
        let response = self
            .http
            .delete(format!("{}/certificates/{af_unique_id}", self.base))
            .send()
            .await?;
        Self::check(response.status())
    }

    pub async fn delete_content_hosting_configuration(
        &self,
        provisioning_session_id: &str,
    ) -> Result<(), M3Error> {
        let response = self
            .http
            .delete(format!(
                "{}/content-hosting-configurations/{provisioning_session_id}",
                self.base
            ))
            .send()
            .await?;
        Self::check(response.status())
    }

    /// POST .../purge with an optional form-encoded filter. Returns the
    /// number of purged entries when the server reports one.
    pub async fn purge_content_hosting_cache(
        &self,
        provisioning_session_id: &str,
        pattern: Option<&str>,
    ) -> Result<u32, M3Error> {
        let mut request = self.http.post(format!(
            "{}/content-hosting-configurations/{provisioning_session_id}/purge",
            self.base
        ));
        if let Some(pattern) = pattern {
            request = request
                .header(reqwest::header::CONTENT_TYPE, FORM_CONTENT_TYPE)
                .body(pattern.to_string());
        }
        let response = request.send().await?;
        let status = response.status();
        Self::check(status)?;
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(0);
        }
        let body = response.text().await.unwrap_or_default();
        Ok(parse_purge_count(&body))
    }
}

/// The purge response body is either a bare integer or a JSON object
/// with a `purged` member; anything else counts as zero.
fn parse_purge_count(body: &str) -> u32 {
    let trimmed = body.trim();
    if let Ok(count) = trimmed.parse::<u32>() {
        return count;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|v| v.get("purged").and_then(Value::as_u64))
        .map(|n| n as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retriable() {
        assert!(M3Error::Transport("refused".into()).retriable());
    }

    #[test]
    fn server_errors_are_retriable_client_errors_are_not() {
        assert!(M3Error::Status(503).retriable());
        assert!(!M3Error::Status(404).retriable());
        assert!(!M3Error::Status(409).retriable());
    }

    #[test]
    fn purge_count_parses_bare_integer() {
        assert_eq!(parse_purge_count("7"), 7);
    }

    #[test]
    fn purge_count_parses_object_form() {
        assert_eq!(parse_purge_count(r#"{"purged": 12}"#), 12);
    }

    #[test]
    fn purge_count_defaults_to_zero() {
        assert_eq!(parse_purge_count(""), 0);
        assert_eq!(parse_purge_count("gone"), 0);
    }
}
