//! Check evaluation against the upstream provider.
//!
//! The validator is a stateless interpreter: it builds the upstream URL for
//! a check, hands it to the dispatcher, and reduces the outcome to a
//! verdict. Response bodies are heterogeneous, so they are probed as
//! permissive JSON trees rather than deserialised into fixed shapes.

use std::sync::Arc;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::queue::CheckName;

/// Verdict of one check attempt.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// The upstream answered and the check is decided.
    Settled {
        passed: bool,
        /// Set when the pass came from a private-profile signal; the
        /// scheduler uses this to short-circuit dependent checks.
        private: bool,
        details: Option<serde_json::Value>,
    },
    /// Every connection for the check's endpoint class is cooling.
    Deferred { wait_ms: u64 },
    /// Terminal dispatch failure; the scheduler defers and retries later.
    TransportError { message: String },
}

impl Verdict {
    fn passed(details: Option<serde_json::Value>) -> Self {
        Verdict::Settled {
            passed: true,
            private: false,
            details,
        }
    }

    fn passed_private() -> Self {
        Verdict::Settled {
            passed: true,
            private: true,
            details: None,
        }
    }

    fn failed(details: serde_json::Value) -> Self {
        Verdict::Settled {
            passed: false,
            private: false,
            details: Some(details),
        }
    }
}

/// Maximum account level an acceptable profile may have.
const MAX_STEAM_LEVEL: i64 = 13;
/// Maximum friends-list size an acceptable profile may have.
const MAX_FRIENDS: usize = 60;

pub struct Validator {
    dispatcher: Arc<Dispatcher>,
    steam_api_base: String,
    community_base: String,
    api_key: String,
}

impl Validator {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &Config) -> Self {
        Self {
            dispatcher,
            steam_api_base: config.steam_api_base.clone(),
            community_base: config.community_base.clone(),
            api_key: config.steam_api_key.clone(),
        }
    }

    /// Run one check for one profile.
    pub async fn run_check(&self, check: CheckName, steam_id: &str) -> Verdict {
        let url = self.url_for(check, steam_id);
        match self.dispatcher.request(&url).await {
            Outcome::Deferred { wait_ms, .. } => Verdict::Deferred { wait_ms },
            Outcome::Failed { kind, message } => Verdict::TransportError {
                message: format!("{kind}: {message}"),
            },
            Outcome::Ok { body, private } => interpret(check, &body, private),
        }
    }

    fn url_for(&self, check: CheckName, steam_id: &str) -> String {
        let base = &self.steam_api_base;
        let key = &self.api_key;
        match check {
            CheckName::AnimatedAvatar => format!(
                "{base}/IPlayerService/GetAnimatedAvatar/v1/?key={key}&steamid={steam_id}"
            ),
            CheckName::AvatarFrame => {
                format!("{base}/IPlayerService/GetAvatarFrame/v1/?key={key}&steamid={steam_id}")
            }
            CheckName::MiniProfileBackground => format!(
                "{base}/IPlayerService/GetMiniProfileBackground/v1/?key={key}&steamid={steam_id}"
            ),
            CheckName::ProfileBackground => format!(
                "{base}/IPlayerService/GetProfileBackground/v1/?key={key}&steamid={steam_id}"
            ),
            CheckName::SteamLevel => {
                format!("{base}/IPlayerService/GetSteamLevel/v1/?key={key}&steamid={steam_id}")
            }
            CheckName::Friends => format!(
                "{base}/ISteamUser/GetFriendList/v1/?key={key}&steamid={steam_id}&relationship=friend"
            ),
            CheckName::CsgoInventory => format!(
                "{}/inventory/{steam_id}/730/2?l=english&count=75",
                self.community_base
            ),
        }
    }
}

/// Reduce a successful dispatch to a verdict. Pure, so the per-check
/// predicates are testable without any network plumbing.
fn interpret(check: CheckName, body: &serde_json::Value, private: bool) -> Verdict {
    match check {
        CheckName::AnimatedAvatar => cosmetic_verdict(body, "avatar"),
        CheckName::AvatarFrame => cosmetic_verdict(body, "avatar_frame"),
        CheckName::MiniProfileBackground | CheckName::ProfileBackground => {
            cosmetic_verdict(body, "profile_background")
        }
        CheckName::SteamLevel => steam_level_verdict(body),
        CheckName::Friends => friends_verdict(body, private),
        CheckName::CsgoInventory => inventory_verdict(body, private),
    }
}

/// Cosmetic checks pass when the response carries the field and it is
/// empty, meaning the profile has not equipped that item.
fn cosmetic_verdict(body: &serde_json::Value, field: &str) -> Verdict {
    match body.pointer(&format!("/response/{field}")) {
        Some(value) if is_empty_value(value) => Verdict::passed(None),
        Some(value) => Verdict::failed(serde_json::json!({ field: value.clone() })),
        None => Verdict::failed(serde_json::json!({
            "error": format!("response missing `{field}`")
        })),
    }
}

/// An empty `response` means the profile is private, which passes. Public
/// profiles pass while their level is at most `MAX_STEAM_LEVEL`.
fn steam_level_verdict(body: &serde_json::Value) -> Verdict {
    let response = body.get("response");
    match response {
        None => Verdict::passed_private(),
        Some(response) if is_empty_value(response) => Verdict::passed_private(),
        Some(response) => match response.get("player_level").and_then(|v| v.as_i64()) {
            // A response without a level is the private shape as well.
            None => Verdict::passed_private(),
            Some(level) if level <= MAX_STEAM_LEVEL => {
                Verdict::passed(Some(serde_json::json!({ "player_level": level })))
            }
            Some(level) => Verdict::failed(serde_json::json!({ "player_level": level })),
        },
    }
}

/// 401 already surfaced as a private pass; otherwise the friends list must
/// be small enough.
fn friends_verdict(body: &serde_json::Value, private: bool) -> Verdict {
    if private {
        return Verdict::passed_private();
    }
    let count = body
        .pointer("/friendslist/friends")
        .and_then(|v| v.as_array())
        .map(|friends| friends.len())
        .unwrap_or(0);
    if count <= MAX_FRIENDS {
        Verdict::passed(Some(serde_json::json!({ "friend_count": count })))
    } else {
        Verdict::failed(serde_json::json!({ "friend_count": count }))
    }
}

/// A hidden or empty inventory passes; visible items fail with the count.
fn inventory_verdict(body: &serde_json::Value, private: bool) -> Verdict {
    if private {
        return Verdict::passed_private();
    }
    if is_empty_value(body) {
        return Verdict::passed(None);
    }
    match body.get("total_inventory_count").and_then(|v| v.as_u64()) {
        Some(0) => Verdict::passed(Some(serde_json::json!({ "item_count": 0 }))),
        Some(count) => Verdict::failed(serde_json::json!({ "item_count": count })),
        None => {
            let assets = body
                .get("assets")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            if assets == 0 {
                Verdict::passed(None)
            } else {
                Verdict::failed(serde_json::json!({ "item_count": assets }))
            }
        }
    }
}

/// Null, `{}`, `[]` and `""` all count as "nothing there" for the
/// provider's loosely-shaped bodies.
fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_passed(verdict: &Verdict) {
        match verdict {
            Verdict::Settled { passed: true, .. } => {}
            other => panic!("expected pass, got {other:?}"),
        }
    }

    fn assert_failed(verdict: &Verdict) {
        match verdict {
            Verdict::Settled { passed: false, .. } => {}
            other => panic!("expected fail, got {other:?}"),
        }
    }

    fn assert_private_pass(verdict: &Verdict) {
        match verdict {
            Verdict::Settled {
                passed: true,
                private: true,
                ..
            } => {}
            other => panic!("expected private pass, got {other:?}"),
        }
    }

    #[test]
    fn cosmetic_checks_pass_on_empty_field() {
        let empty = json!({"response": {"avatar": {}}});
        assert_passed(&interpret(CheckName::AnimatedAvatar, &empty, false));

        let equipped = json!({"response": {"avatar": {"image_small": "x.png"}}});
        assert_failed(&interpret(CheckName::AnimatedAvatar, &equipped, false));

        // Field absent entirely is not a pass.
        let missing = json!({"response": {}});
        assert_failed(&interpret(CheckName::AnimatedAvatar, &missing, false));
    }

    #[test]
    fn all_four_cosmetic_checks_probe_their_field() {
        let frame = json!({"response": {"avatar_frame": {}}});
        assert_passed(&interpret(CheckName::AvatarFrame, &frame, false));

        let background = json!({"response": {"profile_background": {}}});
        assert_passed(&interpret(CheckName::MiniProfileBackground, &background, false));
        assert_passed(&interpret(CheckName::ProfileBackground, &background, false));

        let equipped = json!({"response": {"profile_background": {"item_id": 9}}});
        assert_failed(&interpret(CheckName::ProfileBackground, &equipped, false));
    }

    #[test]
    fn steam_level_empty_response_is_a_private_pass() {
        assert_private_pass(&interpret(CheckName::SteamLevel, &json!({"response": {}}), false));
        assert_private_pass(&interpret(CheckName::SteamLevel, &json!({}), false));
    }

    #[test]
    fn steam_level_threshold_is_thirteen() {
        let low = json!({"response": {"player_level": 5}});
        assert_passed(&interpret(CheckName::SteamLevel, &low, false));
        let boundary = json!({"response": {"player_level": 13}});
        assert_passed(&interpret(CheckName::SteamLevel, &boundary, false));
        let high = json!({"response": {"player_level": 14}});
        assert_failed(&interpret(CheckName::SteamLevel, &high, false));
    }

    #[test]
    fn friends_private_signal_passes_without_counting() {
        assert_private_pass(&interpret(
            CheckName::Friends,
            &serde_json::Value::Null,
            true,
        ));
    }

    #[test]
    fn friends_threshold_is_sixty() {
        let few = json!({"friendslist": {"friends": [{"steamid": "1"}, {"steamid": "2"}]}});
        assert_passed(&interpret(CheckName::Friends, &few, false));

        let sixty: Vec<_> = (0..60).map(|i| json!({"steamid": i.to_string()})).collect();
        assert_passed(&interpret(
            CheckName::Friends,
            &json!({"friendslist": {"friends": sixty}}),
            false,
        ));

        let many: Vec<_> = (0..61).map(|i| json!({"steamid": i.to_string()})).collect();
        assert_failed(&interpret(
            CheckName::Friends,
            &json!({"friendslist": {"friends": many}}),
            false,
        ));
    }

    #[test]
    fn inventory_hidden_or_empty_passes() {
        assert_private_pass(&interpret(
            CheckName::CsgoInventory,
            &serde_json::Value::Null,
            true,
        ));
        assert_passed(&interpret(
            CheckName::CsgoInventory,
            &serde_json::Value::Null,
            false,
        ));
        assert_passed(&interpret(CheckName::CsgoInventory, &json!({}), false));
        assert_passed(&interpret(
            CheckName::CsgoInventory,
            &json!({"success": 1, "total_inventory_count": 0}),
            false,
        ));
    }

    #[test]
    fn inventory_with_items_fails_with_count() {
        let verdict = interpret(
            CheckName::CsgoInventory,
            &json!({"success": 1, "total_inventory_count": 17, "assets": [{}]}),
            false,
        );
        match verdict {
            Verdict::Settled {
                passed: false,
                details: Some(details),
                ..
            } => assert_eq!(details["item_count"], 17),
            other => panic!("expected fail with count, got {other:?}"),
        }
    }
}
