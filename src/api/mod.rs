//! HTTP admission and status API.
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /health/cooldowns` - Cooldown matrix health and overall status
//! - `POST /profiles` - Enqueue one profile or an array of profiles
//! - `GET /profiles/queue` - Queue contents and statistics
//! - `DELETE /profiles/:steam_id` - Drop a queued profile
//! - `GET /proxies` - List outbound connections with cooldown-aware availability
//! - `POST /proxies` - Register a SOCKS5 proxy
//! - `DELETE /proxies` - Remove a SOCKS5 proxy

mod health;
mod profiles;
mod proxies;
mod routes;
pub mod types;

pub use routes::serve;
