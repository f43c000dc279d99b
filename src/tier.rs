//! Subscription tiers and the resource budgets they unlock.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Subscription level. Declaration order is the tier order
/// (`Free < Regular < Vip`), which the derived `Ord` relies on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UserTier {
    Free,
    Regular,
    Vip,
}

impl UserTier {
    pub const ALL: [Self; 3] = [Self::Free, Self::Regular, Self::Vip];
}

/// Budget and model defaults for one tier, as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_memories: usize,
    pub max_context_length: usize,
    pub default_model: String,
    /// Timeout applied to every external call made on behalf of this tier.
    pub call_timeout_secs: u64,
    /// Default target length (characters) handed to the writer.
    pub target_length: usize,
}

impl TierLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    /// Built-in limits used when the config file does not override them.
    pub fn defaults_for(tier: UserTier) -> Self {
        match tier {
            UserTier::Free => Self {
                max_memories: 5,
                max_context_length: 4000,
                default_model: "gpt-4o-mini".into(),
                call_timeout_secs: 15,
                target_length: 800,
            },
            UserTier::Regular => Self {
                max_memories: 10,
                max_context_length: 8000,
                default_model: "gpt-4o-mini".into(),
                call_timeout_secs: 30,
                target_length: 1500,
            },
            UserTier::Vip => Self {
                max_memories: 15,
                max_context_length: 12000,
                default_model: "gpt-4o".into(),
                call_timeout_secs: 60,
                target_length: 3000,
            },
        }
    }
}

/// Per-tier table. Lookups are pure and infallible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(default = "default_free")]
    pub free: TierLimits,
    #[serde(default = "default_regular")]
    pub regular: TierLimits,
    #[serde(default = "default_vip")]
    pub vip: TierLimits,
}

fn default_free() -> TierLimits {
    TierLimits::defaults_for(UserTier::Free)
}
fn default_regular() -> TierLimits {
    TierLimits::defaults_for(UserTier::Regular)
}
fn default_vip() -> TierLimits {
    TierLimits::defaults_for(UserTier::Vip)
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            free: default_free(),
            regular: default_regular(),
            vip: default_vip(),
        }
    }
}

impl TierPolicy {
    pub fn limits_for(&self, tier: UserTier) -> &TierLimits {
        match tier {
            UserTier::Free => &self.free,
            UserTier::Regular => &self.regular,
            UserTier::Vip => &self.vip,
        }
    }

    /// Reject tables where a higher tier gets a smaller budget than a lower one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in UserTier::ALL {
            let limits = self.limits_for(tier);
            if limits.max_memories == 0 || limits.max_context_length == 0 {
                return Err(ConfigError::Validation(format!(
                    "tier {tier} must allow at least one memory and a non-zero context"
                )));
            }
        }

        for pair in UserTier::ALL.windows(2) {
            let (lower, higher) = (self.limits_for(pair[0]), self.limits_for(pair[1]));
            if lower.max_memories > higher.max_memories {
                return Err(ConfigError::Validation(format!(
                    "tier {} allows more memories than tier {}",
                    pair[0], pair[1]
                )));
            }
            if lower.max_context_length > higher.max_context_length {
                return Err(ConfigError::Validation(format!(
                    "tier {} allows a longer context than tier {}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(())
    }
}
