//! Upstream endpoint classification.
//!
//! The provider rate-limits per endpoint, not per host, so every outbound
//! URL is mapped onto a closed set of endpoint classes and cooldown state is
//! tracked per `(connection, class)` cell.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Closed set of upstream endpoint classes sharing rate-limit state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    AnimatedAvatar,
    AvatarFrame,
    MiniProfileBackground,
    ProfileBackground,
    SteamLevel,
    Friends,
    Inventory,
    Other,
}

impl EndpointClass {
    /// Every class, in a stable order (used by health reporting and the
    /// cooldown matrix scans).
    pub const ALL: [EndpointClass; 8] = [
        EndpointClass::AnimatedAvatar,
        EndpointClass::AvatarFrame,
        EndpointClass::MiniProfileBackground,
        EndpointClass::ProfileBackground,
        EndpointClass::SteamLevel,
        EndpointClass::Friends,
        EndpointClass::Inventory,
        EndpointClass::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::AnimatedAvatar => "animated_avatar",
            EndpointClass::AvatarFrame => "avatar_frame",
            EndpointClass::MiniProfileBackground => "mini_profile_background",
            EndpointClass::ProfileBackground => "profile_background",
            EndpointClass::SteamLevel => "steam_level",
            EndpointClass::Friends => "friends",
            EndpointClass::Inventory => "inventory",
            EndpointClass::Other => "other",
        }
    }

    /// Request timeout for this class. Community inventory pages are much
    /// slower than the Web API endpoints.
    pub fn request_timeout(&self) -> Duration {
        match self {
            EndpointClass::Inventory => Duration::from_secs(25),
            _ => Duration::from_secs(15),
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring classification table, first hit wins.
///
/// `GetFriendList` and `inventory` are checked before the profile-cosmetic
/// endpoints; `GetMiniProfileBackground` must precede `GetProfileBackground`
/// or it would never match.
const CLASSIFICATION_TABLE: &[(&str, EndpointClass)] = &[
    ("GetFriendList", EndpointClass::Friends),
    ("inventory", EndpointClass::Inventory),
    ("GetSteamLevel", EndpointClass::SteamLevel),
    ("GetAnimatedAvatar", EndpointClass::AnimatedAvatar),
    ("GetAvatarFrame", EndpointClass::AvatarFrame),
    ("GetMiniProfileBackground", EndpointClass::MiniProfileBackground),
    ("GetProfileBackground", EndpointClass::ProfileBackground),
];

/// Classify an upstream URL into its endpoint class.
pub fn classify_url(url: &str) -> EndpointClass {
    for (needle, class) in CLASSIFICATION_TABLE {
        if url.contains(needle) {
            return *class;
        }
    }
    EndpointClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_web_api_urls() {
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetAnimatedAvatar/v1/?key=K&steamid=1"),
            EndpointClass::AnimatedAvatar
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetAvatarFrame/v1/"),
            EndpointClass::AvatarFrame
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetMiniProfileBackground/v1/"),
            EndpointClass::MiniProfileBackground
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetProfileBackground/v1/"),
            EndpointClass::ProfileBackground
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/IPlayerService/GetSteamLevel/v1/"),
            EndpointClass::SteamLevel
        );
        assert_eq!(
            classify_url("https://api.steampowered.com/ISteamUser/GetFriendList/v1/?relationship=friend"),
            EndpointClass::Friends
        );
        assert_eq!(
            classify_url("https://steamcommunity.com/inventory/76561198000000001/730/2?l=english&count=75"),
            EndpointClass::Inventory
        );
    }

    #[test]
    fn unknown_urls_fall_through_to_other() {
        assert_eq!(
            classify_url("https://api.steampowered.com/ISteamUser/GetPlayerSummaries/v2/"),
            EndpointClass::Other
        );
        assert_eq!(classify_url(""), EndpointClass::Other);
    }

    #[test]
    fn mini_profile_background_wins_over_profile_background() {
        // Table order, not match length, decides.
        let url = "https://api.steampowered.com/IPlayerService/GetMiniProfileBackground/v1/";
        assert_eq!(classify_url(url), EndpointClass::MiniProfileBackground);
    }

    #[test]
    fn timeouts_follow_class() {
        assert_eq!(
            EndpointClass::Inventory.request_timeout(),
            Duration::from_secs(25)
        );
        assert_eq!(
            EndpointClass::Friends.request_timeout(),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn serde_tags_are_snake_case() {
        let json = serde_json::to_string(&EndpointClass::MiniProfileBackground).unwrap();
        assert_eq!(json, "\"mini_profile_background\"");
        let back: EndpointClass = serde_json::from_str("\"steam_level\"").unwrap();
        assert_eq!(back, EndpointClass::SteamLevel);
    }
}
