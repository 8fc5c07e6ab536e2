// ABOUTME: Static source-to-destination channel routing for one relay direction
// ABOUTME: Mapped channels resolve in O(1); unmapped ones fall back to an overflow channel if configured

use std::collections::HashMap;

/// One externally configured channel pair
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChannelMapping {
    pub slack_channel_id: String,
    pub discord_channel_id: String,
}

/// Routing decision for a source channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Channel has an explicit mapping
    Mapped(String),
    /// Channel is unmapped; relay to the overflow channel with an annotation
    Fallback(String),
    /// Unmapped and no overflow channel configured
    Unroutable,
}

impl Route {
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Mapped(dest) | Self::Fallback(dest) => Some(dest),
            Self::Unroutable => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

/// Routing table for one direction of the bridge
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    table: HashMap<String, String>,
    fallback: Option<String>,
}

impl ChannelRouter {
    pub fn new(table: HashMap<String, String>, fallback: Option<String>) -> Self {
        Self { table, fallback }
    }

    /// Router for messages leaving Slack
    pub fn slack_to_discord(mappings: &[ChannelMapping], fallback: Option<String>) -> Self {
        let table = mappings
            .iter()
            .map(|m| (m.slack_channel_id.clone(), m.discord_channel_id.clone()))
            .collect();
        Self::new(table, fallback)
    }

    /// Router for messages leaving Discord
    pub fn discord_to_slack(mappings: &[ChannelMapping], fallback: Option<String>) -> Self {
        let table = mappings
            .iter()
            .map(|m| (m.discord_channel_id.clone(), m.slack_channel_id.clone()))
            .collect();
        Self::new(table, fallback)
    }

    /// Explicit mapping only; `None` means unmapped
    pub fn resolve(&self, source_channel_id: &str) -> Option<&str> {
        self.table.get(source_channel_id).map(String::as_str)
    }

    pub fn route(&self, source_channel_id: &str) -> Route {
        if let Some(dest) = self.resolve(source_channel_id) {
            return Route::Mapped(dest.to_string());
        }
        match &self.fallback {
            Some(dest) => Route::Fallback(dest.clone()),
            None => Route::Unroutable,
        }
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> Vec<ChannelMapping> {
        vec![
            ChannelMapping {
                slack_channel_id: "C1".to_string(),
                discord_channel_id: "D1".to_string(),
            },
            ChannelMapping {
                slack_channel_id: "C2".to_string(),
                discord_channel_id: "D2".to_string(),
            },
        ]
    }

    #[test]
    fn test_mapped_channel() {
        let router = ChannelRouter::slack_to_discord(&mappings(), None);
        assert_eq!(router.resolve("C1"), Some("D1"));
        assert_eq!(router.route("C2"), Route::Mapped("D2".to_string()));
    }

    #[test]
    fn test_reverse_direction_inverts_table() {
        let router = ChannelRouter::discord_to_slack(&mappings(), None);
        assert_eq!(router.resolve("D1"), Some("C1"));
        assert_eq!(router.resolve("C1"), None);
    }

    #[test]
    fn test_unmapped_uses_fallback() {
        let router =
            ChannelRouter::discord_to_slack(&mappings(), Some("C_OVERFLOW".to_string()));
        for unknown in ["D9", "", "123456789"] {
            let route = router.route(unknown);
            assert_eq!(route, Route::Fallback("C_OVERFLOW".to_string()));
            assert!(route.is_fallback());
        }
    }

    #[test]
    fn test_unmapped_without_fallback_is_unroutable() {
        let router = ChannelRouter::slack_to_discord(&mappings(), None);
        let route = router.route("C9");
        assert_eq!(route, Route::Unroutable);
        assert_eq!(route.destination(), None);
    }

    #[test]
    fn test_mapping_wins_over_fallback() {
        let router = ChannelRouter::slack_to_discord(&mappings(), Some("D_OVERFLOW".to_string()));
        assert_eq!(router.route("C1").destination(), Some("D1"));
        assert!(!router.route("C1").is_fallback());
        assert_eq!(router.len(), 2);
    }
}
