use std::collections::BTreeMap;

use crate::config::model::ChatChannelConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MappedChannel {
    /// provider id -> native channel id, one entry per provider.
    natives: BTreeMap<String, String>,
    admin: bool,
    watchdog: bool,
}

/// Logical channel id <-> per-provider native channel ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    channels: BTreeMap<String, MappedChannel>,
}

impl ChannelMap {
    /// Later entries for the same logical id replace earlier ones.
    pub fn from_configs(configs: &[ChatChannelConfig]) -> Self {
        let channels = configs
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    MappedChannel {
                        natives: c.providers.clone(),
                        admin: c.admin,
                        watchdog: c.watchdog,
                    },
                )
            })
            .collect();
        Self { channels }
    }

    pub fn contains(&self, logical: &str) -> bool {
        self.channels.contains_key(logical)
    }

    /// `(provider, native)` pairs serving a logical channel.
    pub fn targets(&self, logical: &str) -> Option<Vec<(String, String)>> {
        self.channels.get(logical).map(|c| {
            c.natives
                .iter()
                .map(|(p, n)| (p.clone(), n.clone()))
                .collect()
        })
    }

    pub fn logical_for(&self, provider: &str, native: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, c)| c.natives.get(provider).is_some_and(|n| n == native))
            .map(|(id, _)| id.as_str())
    }

    /// Native channels a provider should join.
    pub fn natives_for(&self, provider: &str) -> Vec<String> {
        let mut natives: Vec<String> = self
            .channels
            .values()
            .filter_map(|c| c.natives.get(provider).cloned())
            .collect();
        natives.sort();
        natives.dedup();
        natives
    }

    pub fn watchdog_channels(&self) -> Vec<String> {
        self.flagged(|c| c.watchdog)
    }

    pub fn admin_channels(&self) -> Vec<String> {
        self.flagged(|c| c.admin)
    }

    fn flagged(&self, pred: impl Fn(&MappedChannel) -> bool) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, c)| pred(c))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, providers: &[(&str, &str)], admin: bool, watchdog: bool) -> ChatChannelConfig {
        ChatChannelConfig {
            id: id.to_string(),
            providers: providers
                .iter()
                .map(|(p, n)| (p.to_string(), n.to_string()))
                .collect(),
            admin,
            watchdog,
        }
    }

    #[test]
    fn maps_both_directions() {
        let map = ChannelMap::from_configs(&[
            channel("ops", &[("irc", "#ops"), ("discord", "123")], true, true),
            channel("public", &[("irc", "#game")], false, false),
        ]);
        assert_eq!(
            map.targets("ops").unwrap(),
            vec![
                ("discord".to_string(), "123".to_string()),
                ("irc".to_string(), "#ops".to_string())
            ]
        );
        assert_eq!(map.logical_for("irc", "#game"), Some("public"));
        assert_eq!(map.logical_for("discord", "#game"), None);
        assert!(map.targets("missing").is_none());
        assert_eq!(map.natives_for("irc"), vec!["#game", "#ops"]);
    }

    #[test]
    fn flags_select_channels() {
        let map = ChannelMap::from_configs(&[
            channel("ops", &[("irc", "#ops")], true, false),
            channel("alerts", &[("irc", "#alerts")], false, true),
        ]);
        assert_eq!(map.admin_channels(), vec!["ops"]);
        assert_eq!(map.watchdog_channels(), vec!["alerts"]);
    }

    #[test]
    fn duplicate_logical_id_keeps_last() {
        let map = ChannelMap::from_configs(&[
            channel("ops", &[("irc", "#old")], false, false),
            channel("ops", &[("irc", "#new")], false, false),
        ]);
        assert_eq!(map.natives_for("irc"), vec!["#new"]);
    }
}
