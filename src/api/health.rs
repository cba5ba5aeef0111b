//! Liveness and cooldown-health handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, response::Json};

use super::routes::AppState;
use super::types::*;
use crate::connections::Connection;
use crate::cooldowns::CooldownCell;
use crate::endpoints::EndpointClass;
use crate::util::{ms_to_minutes_ceil, now_ms};

/// Remaining cooldown at or above this counts as "long" in the summary.
const LONG_COOLDOWN_MS: u64 = 30 * 60 * 1000;

/// `GET /health`
pub async fn liveness(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "deferred_checks": state.scheduler.deferred_count().await,
    }))
}

/// `GET /health/cooldowns`
pub async fn cooldowns(State(state): State<Arc<AppState>>) -> Json<CooldownsResponse> {
    let (connections, cells) = state.cooldowns.snapshot().await;
    Json(build_response(connections, cells, now_ms()))
}

/// Assemble the health report from a matrix snapshot. Pure so the status
/// classification is testable.
fn build_response(
    connections: Vec<Connection>,
    cells: Vec<CooldownCell>,
    now: i64,
) -> CooldownsResponse {
    let mut cooldowns = BTreeMap::new();
    let mut endpoints_in_cooldown = Vec::new();
    let mut short_cooldowns = Vec::new();
    let mut long_cooldowns = Vec::new();
    let mut cooling_connections = std::collections::HashSet::new();

    for connection in &connections {
        let key = conn_key(connection);
        let mut endpoints = BTreeMap::new();
        for endpoint in EndpointClass::ALL {
            if endpoint == EndpointClass::Other {
                continue;
            }
            let cell = cells
                .iter()
                .find(|c| c.connection.index == connection.index && c.endpoint == endpoint);
            let info = match cell {
                Some(cell) => {
                    let remaining_ms = cell.record.remaining_ms(now);
                    let remaining_minutes = ms_to_minutes_ceil(remaining_ms);
                    cooling_connections.insert(connection.index);
                    if !endpoints_in_cooldown.contains(&endpoint) {
                        endpoints_in_cooldown.push(endpoint);
                    }
                    let cell_ref = CooldownCellRef {
                        connection: key.clone(),
                        endpoint,
                        remaining_minutes,
                    };
                    if remaining_ms >= LONG_COOLDOWN_MS {
                        long_cooldowns.push(cell_ref);
                    } else {
                        short_cooldowns.push(cell_ref);
                    }
                    EndpointCooldownInfo {
                        in_cooldown: true,
                        remaining_ms,
                        remaining_minutes,
                        reason: Some(cell.record.reason),
                        backoff_level: cell.record.backoff_level,
                        until: Some(cell.record.cooldown_until),
                    }
                }
                None => EndpointCooldownInfo {
                    in_cooldown: false,
                    remaining_ms: 0,
                    remaining_minutes: 0,
                    reason: None,
                    backoff_level: None,
                    until: None,
                },
            };
            endpoints.insert(endpoint, info);
        }
        cooldowns.insert(
            key,
            ConnectionCooldowns {
                kind: connection.kind,
                url: connection.url.clone(),
                endpoints,
            },
        );
    }

    endpoints_in_cooldown.sort();

    let overall_status = if long_cooldowns.is_empty() && short_cooldowns.is_empty() {
        OverallStatus::Healthy
    } else if long_cooldowns.is_empty() {
        OverallStatus::Limited
    } else {
        OverallStatus::Degraded
    };

    let summary = CooldownSummary {
        total_connections: connections.len(),
        available_connections: connections.len() - cooling_connections.len(),
        endpoints_in_cooldown,
        short_cooldowns,
        long_cooldowns,
    };

    CooldownsResponse {
        cooldowns,
        summary,
        overall_status,
    }
}

fn conn_key(connection: &Connection) -> String {
    format!("{}_{}", connection.index, connection.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionKind;
    use crate::cooldowns::{CooldownReason, CooldownRecord};

    fn direct() -> Connection {
        Connection {
            index: 0,
            kind: ConnectionKind::Direct,
            url: None,
        }
    }

    fn cell(minutes_remaining: i64, now: i64) -> CooldownCell {
        CooldownCell {
            connection: direct(),
            endpoint: EndpointClass::Friends,
            record: CooldownRecord {
                cooldown_until: now + minutes_remaining * 60_000,
                reason: CooldownReason::RateLimited,
                backoff_level: Some(1),
                applied_at: now - 60_000,
                error_message: "HTTP 429".to_string(),
                duration_ms: (minutes_remaining as u64 + 1) * 60_000,
            },
        }
    }

    #[test]
    fn no_cooldowns_is_healthy() {
        let response = build_response(vec![direct()], vec![], 1_000_000);
        assert_eq!(response.overall_status, OverallStatus::Healthy);
        assert_eq!(response.summary.total_connections, 1);
        assert_eq!(response.summary.available_connections, 1);
        assert!(response.summary.endpoints_in_cooldown.is_empty());

        let connection = response.cooldowns.get("0_direct").unwrap();
        // Every reportable endpoint class is listed, all free.
        assert_eq!(connection.endpoints.len(), EndpointClass::ALL.len() - 1);
        assert!(connection.endpoints.values().all(|e| !e.in_cooldown));
    }

    #[test]
    fn short_cooldown_is_limited() {
        let now = 1_000_000;
        let response = build_response(vec![direct()], vec![cell(10, now)], now);
        assert_eq!(response.overall_status, OverallStatus::Limited);
        assert_eq!(response.summary.available_connections, 0);
        assert_eq!(response.summary.short_cooldowns.len(), 1);
        assert!(response.summary.long_cooldowns.is_empty());
        assert_eq!(
            response.summary.endpoints_in_cooldown,
            vec![EndpointClass::Friends]
        );

        let info = response
            .cooldowns
            .get("0_direct")
            .unwrap()
            .endpoints
            .get(&EndpointClass::Friends)
            .unwrap();
        assert!(info.in_cooldown);
        assert_eq!(info.remaining_minutes, 10);
        assert_eq!(info.backoff_level, Some(1));
    }

    #[test]
    fn long_cooldown_is_degraded() {
        let now = 1_000_000;
        let response = build_response(vec![direct()], vec![cell(45, now)], now);
        assert_eq!(response.overall_status, OverallStatus::Degraded);
        assert_eq!(response.summary.long_cooldowns.len(), 1);
    }

    #[test]
    fn thirty_minutes_counts_as_long() {
        let now = 1_000_000;
        let response = build_response(vec![direct()], vec![cell(30, now)], now);
        assert_eq!(response.overall_status, OverallStatus::Degraded);
    }
}
