//! Outbound request dispatch.
//!
//! Classifies each upstream URL into an endpoint class, picks the best
//! currently-available connection (direct preferred, then proxies in
//! round-robin order), enforces a global inter-call gap, categorises
//! failures into cooldown reasons, and walks the remaining connections when
//! a call cools its cell. When the entire column is cooling, the caller gets
//! `Outcome::Deferred` with the wait until the earliest cell frees up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connections::{Connection, ConnectionKind, ConnectionStore};
use crate::cooldowns::{CooldownReason, CooldownStore};
use crate::endpoints::{classify_url, EndpointClass};

/// Browser-like User-Agent sent on every upstream call.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Terminal failure kinds surfaced to the caller (never cooled down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Unexpected upstream status not covered by retry or privacy rules.
    UpstreamOther,
    /// 2xx response whose body was not valid JSON.
    MalformedBody,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamOther => write!(f, "upstream_other"),
            Self::MalformedBody => write!(f, "malformed_body"),
        }
    }
}

/// Result of one dispatched upstream request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The call went through. `private` is set for the provider's
    /// semantically-private statuses (403 on inventory, 401 on friends),
    /// in which case `body` is null.
    Ok {
        body: serde_json::Value,
        private: bool,
    },
    /// Every connection is cooling for this endpoint class.
    Deferred {
        endpoint: EndpointClass,
        wait_ms: u64,
    },
    /// Terminal failure, surfaced without cooling any cell.
    Failed { kind: FailureKind, message: String },
}

/// Transport-level error categories that cool a cell and move the
/// dispatcher on to the next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCategory {
    ConnectionReset,
    Timeout,
    DnsFailure,
    SocksError,
}

impl TransportCategory {
    pub fn cooldown_reason(self) -> CooldownReason {
        match self {
            Self::ConnectionReset => CooldownReason::ConnectionReset,
            Self::Timeout => CooldownReason::Timeout,
            Self::DnsFailure => CooldownReason::DnsFailure,
            Self::SocksError => CooldownReason::SocksError,
        }
    }
}

/// Outcome of a single attempt on one connection.
enum Attempt {
    /// Terminal for the whole request (success, private, or fatal).
    Done(Outcome),
    /// The cell was cooled; try the next connection in this pass.
    Cooled,
}

/// Routes upstream calls across the connection matrix.
pub struct Dispatcher {
    registry: Arc<ConnectionStore>,
    cooldowns: Arc<CooldownStore>,
    /// Last dispatch instant, held across the pacing sleep so calls are
    /// serialised with at least `request_gap` between them.
    pacer: Mutex<Option<tokio::time::Instant>>,
    request_gap: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionStore>,
        cooldowns: Arc<CooldownStore>,
        request_gap: Duration,
    ) -> Self {
        Self {
            registry,
            cooldowns,
            pacer: Mutex::new(None),
            request_gap,
        }
    }

    /// Dispatch `url` over the best available connection.
    ///
    /// One selection pass: the direct connection first when its cell is
    /// free, then proxies from the round-robin cursor. A connection whose
    /// call rate-limits or fails at the transport level is cooled and the
    /// pass moves on; when the pass is exhausted (or was empty to begin
    /// with) the request is deferred.
    pub async fn request(&self, url: &str) -> Outcome {
        let endpoint = classify_url(url);

        let candidates = self.candidates_for(endpoint).await;
        if candidates.is_empty() {
            return self.deferred(endpoint).await;
        }

        for connection in candidates {
            if connection.kind == ConnectionKind::Socks5 {
                self.registry.advance_past(connection.index).await;
            }
            // Every attempt is an upstream call, so every attempt pays the
            // global inter-call gap.
            self.pace().await;
            match self.attempt(&connection, endpoint, url).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Cooled => continue,
            }
        }

        self.deferred(endpoint).await
    }

    async fn deferred(&self, endpoint: EndpointClass) -> Outcome {
        let wait = self.cooldowns.next_available_in_for(endpoint).await;
        tracing::debug!(
            endpoint = %endpoint,
            wait_ms = wait.as_millis() as u64,
            "All connections cooling, deferring"
        );
        Outcome::Deferred {
            endpoint,
            wait_ms: wait.as_millis() as u64,
        }
    }

    /// Enforce the global inter-call gap. The pacer mutex stays held
    /// through the sleep, serialising concurrent dispatches.
    async fn pace(&self) {
        let mut last = self.pacer.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_gap {
                tokio::time::sleep(self.request_gap - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    /// Available connections for one selection pass, direct first.
    async fn candidates_for(&self, endpoint: EndpointClass) -> Vec<Connection> {
        let mut candidates = Vec::new();
        if let Some(direct) = self.registry.get(0).await {
            if self.cooldowns.is_available(0, endpoint).await {
                candidates.push(direct);
            }
        }
        for proxy in self.registry.rotation().await {
            if self.cooldowns.is_available(proxy.index, endpoint).await {
                candidates.push(proxy);
            }
        }
        candidates
    }

    async fn attempt(
        &self,
        connection: &Connection,
        endpoint: EndpointClass,
        url: &str,
    ) -> Attempt {
        let client = match self.build_client(connection, endpoint) {
            Ok(client) => client,
            Err(e) => {
                // An unbuildable proxy URL counts as a SOCKS failure.
                let message = format!("client build failed: {e}");
                tracing::warn!(connection = connection.index, error = %message, "Dropping connection for this pass");
                self.cooldowns
                    .mark(connection.index, endpoint, CooldownReason::SocksError, &message)
                    .await;
                return Attempt::Cooled;
            }
        };

        let mut request = client.get(url);
        if endpoint == EndpointClass::Inventory {
            // The community inventory endpoint is pickier than the Web API
            // and expects browser-shaped fetch metadata.
            request = request
                .header("Accept", "application/json, text/plain, */*")
                .header("Sec-Fetch-Dest", "empty")
                .header("Sec-Fetch-Mode", "cors")
                .header("Sec-Fetch-Site", "same-origin");
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return self
                    .handle_transport_error(connection, endpoint, &e)
                    .await;
            }
        };

        let status = response.status();

        if status.as_u16() == 429 {
            let cooldown = self
                .cooldowns
                .mark(
                    connection.index,
                    endpoint,
                    CooldownReason::RateLimited,
                    "HTTP 429 Too Many Requests",
                )
                .await;
            tracing::warn!(
                connection = connection.index,
                endpoint = %endpoint,
                cooldown_secs = cooldown.as_secs(),
                "Rate limited, trying next connection"
            );
            return Attempt::Cooled;
        }

        // Private-data statuses: 403 on inventory, 401 on friends. Not an
        // error and never cooled down.
        let private_signal = (endpoint == EndpointClass::Inventory && status.as_u16() == 403)
            || (endpoint == EndpointClass::Friends && status.as_u16() == 401);
        if private_signal {
            return Attempt::Done(Outcome::Ok {
                body: serde_json::Value::Null,
                private: true,
            });
        }

        if status.is_success() {
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    return self
                        .handle_transport_error(connection, endpoint, &e)
                        .await;
                }
            };
            self.cooldowns
                .reset_on_success(connection.index, endpoint)
                .await;
            let body = if text.trim().is_empty() {
                serde_json::Value::Null
            } else {
                match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        return Attempt::Done(Outcome::Failed {
                            kind: FailureKind::MalformedBody,
                            message: format!("unparseable 2xx body: {e}"),
                        });
                    }
                }
            };
            return Attempt::Done(Outcome::Ok {
                body,
                private: false,
            });
        }

        Attempt::Done(Outcome::Failed {
            kind: FailureKind::UpstreamOther,
            message: format!("unexpected upstream status {status} for {endpoint}"),
        })
    }

    async fn handle_transport_error(
        &self,
        connection: &Connection,
        endpoint: EndpointClass,
        error: &reqwest::Error,
    ) -> Attempt {
        let message = error_chain_text(error);
        match categorize_transport(&message, error.is_timeout()) {
            Some(category) => {
                let reason = category.cooldown_reason();
                self.cooldowns
                    .mark(connection.index, endpoint, reason, &message)
                    .await;
                tracing::warn!(
                    connection = connection.index,
                    endpoint = %endpoint,
                    reason = %reason,
                    error = %message,
                    "Transport failure, trying next connection"
                );
                Attempt::Cooled
            }
            None => Attempt::Done(Outcome::Failed {
                kind: FailureKind::UpstreamOther,
                message,
            }),
        }
    }

    /// Build the HTTP client bound to one connection, with the endpoint's
    /// timeout. Proxy connections get a SOCKS5 agent.
    fn build_client(
        &self,
        connection: &Connection,
        endpoint: EndpointClass,
    ) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(endpoint.request_timeout())
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy_url) = connection.url.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        builder.build()
    }
}

/// Render a reqwest error with its full source chain, so the categoriser
/// sees the underlying IO/DNS/SOCKS detail rather than the generic wrapper.
fn error_chain_text(error: &reqwest::Error) -> String {
    use std::error::Error as _;
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Map transport-error text onto a cooldown category.
///
/// `None` means the error is not a recognised transport condition and must
/// surface as a terminal failure.
pub fn categorize_transport(message: &str, is_timeout: bool) -> Option<TransportCategory> {
    if is_timeout {
        return Some(TransportCategory::Timeout);
    }
    let lower = message.to_lowercase();

    if lower.contains("socks") {
        return Some(TransportCategory::SocksError);
    }
    if lower.contains("enotfound")
        || lower.contains("ehostunreach")
        || lower.contains("dns error")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("host unreachable")
    {
        return Some(TransportCategory::DnsFailure);
    }
    if lower.contains("etimedout") || lower.contains("timed out") || lower.contains("timeout") {
        return Some(TransportCategory::Timeout);
    }
    if lower.contains("connection reset")
        || lower.contains("econnreset")
        || lower.contains("connection refused")
        || lower.contains("econnrefused")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("socket hang up")
        || lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("handshake")
    {
        return Some(TransportCategory::ConnectionReset);
    }
    None
}
