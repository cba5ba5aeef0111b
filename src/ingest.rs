//! Downstream ingest client.
//!
//! Profiles that pass every check are forwarded here. The contract is
//! at-least-once: retryable failures leave the profile queued for the next
//! scheduler cycle, and the downstream deduplicates ("link already exists"
//! counts as accepted).

use std::time::Duration;

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// 2xx: the profile was accepted.
    Accepted,
    /// The downstream already has this profile; treated as accepted.
    AlreadyExists,
    /// 5xx, transport failure, or explicit temporary unavailability.
    /// The profile stays queued and is re-submitted on a later cycle.
    RetryLater(String),
    /// Any other 4xx: permanent, the profile is dropped with a warning.
    Rejected(String),
}

pub struct IngestClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl IngestClient {
    pub fn new(url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            api_key,
        }
    }

    /// Submit one approved profile.
    pub async fn submit(&self, steam_id: &str, username: &str) -> IngestOutcome {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "steam_id": steam_id,
                "username": username,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return IngestOutcome::RetryLater(format!("transport: {e}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_response(status.as_u16(), &body)
    }
}

/// Status/body triage for the ingest contract. Split out so the retry
/// boundary is testable without a live endpoint.
fn classify_response(status: u16, body: &str) -> IngestOutcome {
    if (200..300).contains(&status) {
        return IngestOutcome::Accepted;
    }
    let lower = body.to_lowercase();
    if lower.contains("already exists") {
        return IngestOutcome::AlreadyExists;
    }
    if status >= 500 || lower.contains("service temporarily unavailable") {
        return IngestOutcome::RetryLater(format!("status {status}: {body}"));
    }
    IngestOutcome::Rejected(format!("status {status}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_duplicate_are_both_accepted() {
        assert_eq!(classify_response(200, ""), IngestOutcome::Accepted);
        assert_eq!(classify_response(201, "{\"ok\":true}"), IngestOutcome::Accepted);
        assert_eq!(
            classify_response(409, "{\"error\":\"link already exists\"}"),
            IngestOutcome::AlreadyExists
        );
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(matches!(
            classify_response(503, "upstream down"),
            IngestOutcome::RetryLater(_)
        ));
        assert!(matches!(
            classify_response(500, ""),
            IngestOutcome::RetryLater(_)
        ));
        assert!(matches!(
            classify_response(400, "Service temporarily unavailable"),
            IngestOutcome::RetryLater(_)
        ));
    }

    #[test]
    fn other_client_errors_are_terminal() {
        assert!(matches!(
            classify_response(422, "bad payload"),
            IngestOutcome::Rejected(_)
        ));
        assert!(matches!(
            classify_response(401, "bad key"),
            IngestOutcome::Rejected(_)
        ));
    }
}
