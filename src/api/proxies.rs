//! Outbound proxy administration handlers.
//!
//! Registry edits re-sync the cooldown matrix so existing cooldown cells
//! follow their connection across renumbering. The listing joins the
//! registry with the cooldown matrix so callers see availability, not just
//! configuration.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};

use super::routes::AppState;
use super::types::{ProxyListEntry, ProxyRequest};
use crate::connections::{Connection, RegistryError};
use crate::cooldowns::CooldownCell;

/// `GET /proxies`
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<ProxyListEntry>> {
    let connections = state.registry.list().await;
    let (_, cells) = state.cooldowns.snapshot().await;
    Json(availability(connections, &cells))
}

/// Join the connection list with the active cooldown cells. Pure so the
/// availability shape is testable.
fn availability(connections: Vec<Connection>, cells: &[CooldownCell]) -> Vec<ProxyListEntry> {
    connections
        .into_iter()
        .map(|connection| {
            let mut cooling_endpoints: Vec<_> = cells
                .iter()
                .filter(|cell| cell.connection.index == connection.index)
                .map(|cell| cell.endpoint)
                .collect();
            cooling_endpoints.sort();
            ProxyListEntry {
                index: connection.index,
                kind: connection.kind,
                url: connection.url,
                available: cooling_endpoints.is_empty(),
                cooling_endpoints,
            }
        })
        .collect()
}

/// `POST /proxies`
pub async fn add(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProxyRequest>,
) -> Result<(StatusCode, Json<Connection>), (StatusCode, String)> {
    let connection = state
        .registry
        .add_proxy(&body.url)
        .await
        .map_err(registry_error_response)?;
    state
        .cooldowns
        .sync_connections(state.registry.list().await)
        .await;
    Ok((StatusCode::CREATED, Json(connection)))
}

/// `DELETE /proxies`
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProxyRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state
        .registry
        .remove_proxy(&body.url)
        .await
        .map_err(registry_error_response)?;
    state
        .cooldowns
        .sync_connections(state.registry.list().await)
        .await;
    Ok(Json(serde_json::json!({ "removed": true })))
}

fn registry_error_response(error: RegistryError) -> (StatusCode, String) {
    let status = match &error {
        RegistryError::NotSocks5(_) | RegistryError::MissingAuthority(_) => {
            StatusCode::BAD_REQUEST
        }
        RegistryError::Duplicate(_) => StatusCode::CONFLICT,
        RegistryError::Unknown(_) => StatusCode::NOT_FOUND,
        RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionKind;
    use crate::cooldowns::{CooldownReason, CooldownRecord};
    use crate::endpoints::EndpointClass;
    use crate::util::now_ms;

    fn connection(index: usize, kind: ConnectionKind, url: Option<&str>) -> Connection {
        Connection {
            index,
            kind,
            url: url.map(str::to_string),
        }
    }

    fn cell(connection: Connection, endpoint: EndpointClass) -> CooldownCell {
        let now = now_ms();
        CooldownCell {
            connection,
            endpoint,
            record: CooldownRecord {
                cooldown_until: now + 60_000,
                reason: CooldownReason::RateLimited,
                backoff_level: Some(0),
                applied_at: now,
                error_message: "HTTP 429".to_string(),
                duration_ms: 60_000,
            },
        }
    }

    #[test]
    fn listing_reports_cooling_endpoints_per_connection() {
        let direct = connection(0, ConnectionKind::Direct, None);
        let proxy = connection(1, ConnectionKind::Socks5, Some("socks5://u:p@a:1080"));
        let cells = vec![
            cell(direct.clone(), EndpointClass::Inventory),
            cell(direct.clone(), EndpointClass::Friends),
        ];

        let entries = availability(vec![direct, proxy], &cells);
        assert_eq!(entries.len(), 2);

        assert!(!entries[0].available);
        assert_eq!(
            entries[0].cooling_endpoints,
            vec![EndpointClass::Friends, EndpointClass::Inventory]
        );

        assert!(entries[1].available);
        assert!(entries[1].cooling_endpoints.is_empty());
        assert_eq!(entries[1].url.as_deref(), Some("socks5://u:p@a:1080"));
    }

    #[test]
    fn listing_without_cooldowns_is_all_available() {
        let entries = availability(
            vec![connection(0, ConnectionKind::Direct, None)],
            &[],
        );
        assert_eq!(entries.len(), 1);
        assert!(entries[0].available);
    }
}
