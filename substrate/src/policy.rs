//! Decides value vs reference routing per message type and size.

use dashmap::DashMap;

/// Routing tier for a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTier {
    AlwaysReference,
    AutoPromote,
    AlwaysValue,
}

/// Auto-promote settings consulted when `tier == AutoPromote`.
#[derive(Debug, Clone, Copy)]
pub struct AutoPromoteSettings {
    pub enabled: bool,
    pub threshold_bytes: u64,
}

impl Default for AutoPromoteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 10 * 1024,
        }
    }
}

/// Routing policy for one message type.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub tier: PolicyTier,
    pub auto_promote: AutoPromoteSettings,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            tier: PolicyTier::AutoPromote,
            auto_promote: AutoPromoteSettings::default(),
        }
    }
}

/// Decides value vs reference routing per message type and size.
///
/// Unknown types fall back to the default policy (`AutoPromote` at 10 KiB).
pub struct PolicyManager {
    default_policy: Policy,
    overrides: DashMap<String, Policy>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self {
            default_policy: Policy::default(),
            overrides: DashMap::new(),
        }
    }

    /// Builds a manager from the spec's `policies.always_reference[]` /
    /// `policies.always_value[]` configuration lists and the
    /// `auto_promote.*` defaults.
    pub fn from_config(
        always_reference: &[String],
        always_value: &[String],
        auto_promote: AutoPromoteSettings,
    ) -> Self {
        let manager = Self {
            default_policy: Policy {
                tier: PolicyTier::AutoPromote,
                auto_promote,
            },
            overrides: DashMap::new(),
        };
        for t in always_reference {
            manager.set_policy(
                t,
                Policy {
                    tier: PolicyTier::AlwaysReference,
                    auto_promote,
                },
            );
        }
        for t in always_value {
            manager.set_policy(
                t,
                Policy {
                    tier: PolicyTier::AlwaysValue,
                    auto_promote,
                },
            );
        }
        manager
    }

    pub fn get_policy(&self, msg_type: &str) -> Policy {
        self.overrides
            .get(msg_type)
            .map(|p| *p)
            .unwrap_or(self.default_policy)
    }

    pub fn set_policy(&self, msg_type: &str, policy: Policy) {
        self.overrides.insert(msg_type.to_string(), policy);
    }

    /// `AlwaysReference` -> true, `AlwaysValue` -> false, `AutoPromote` ->
    /// `size_bytes > threshold_bytes` (only when enabled; disabled
    /// auto-promote always keeps the value inline).
    pub fn should_use_reference(&self, msg_type: &str, size_bytes: u64) -> bool {
        let policy = self.get_policy(msg_type);
        match policy.tier {
            PolicyTier::AlwaysReference => true,
            PolicyTier::AlwaysValue => false,
            PolicyTier::AutoPromote => {
                policy.auto_promote.enabled && size_bytes > policy.auto_promote.threshold_bytes
            }
        }
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_uses_default_auto_promote() {
        let mgr = PolicyManager::new();
        assert!(!mgr.should_use_reference("unknown", 100));
        assert!(mgr.should_use_reference("unknown", 20 * 1024));
    }

    #[test]
    fn always_reference_ignores_size() {
        let mgr = PolicyManager::new();
        mgr.set_policy(
            "blob",
            Policy {
                tier: PolicyTier::AlwaysReference,
                auto_promote: AutoPromoteSettings::default(),
            },
        );
        assert!(mgr.should_use_reference("blob", 1));
    }

    #[test]
    fn always_value_ignores_size() {
        let mgr = PolicyManager::new();
        mgr.set_policy(
            "ping",
            Policy {
                tier: PolicyTier::AlwaysValue,
                auto_promote: AutoPromoteSettings::default(),
            },
        );
        assert!(!mgr.should_use_reference("ping", 1024 * 1024));
    }

    #[test]
    fn auto_promote_threshold_boundary() {
        let mgr = PolicyManager::new();
        assert!(!mgr.should_use_reference("t", 10 * 1024));
        assert!(mgr.should_use_reference("t", 10 * 1024 + 1));
    }

    #[test]
    fn from_config_applies_override_lists() {
        let mgr = PolicyManager::from_config(
            &["blob".to_string()],
            &["ping".to_string()],
            AutoPromoteSettings::default(),
        );
        assert!(mgr.should_use_reference("blob", 1));
        assert!(!mgr.should_use_reference("ping", 1 << 20));
        assert_eq!(mgr.get_policy("other").tier, PolicyTier::AutoPromote);
    }
}
