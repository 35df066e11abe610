//! Static registry mapping strategy ids to rule-set constructors.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::{SignalGenerator, StrategySettings, TrendFollower, TrendParams};

type Builder = fn(&StrategySettings) -> Box<dyn SignalGenerator>;

/// Registry of known signal generators, selected by config id.
pub struct StrategyRegistry {
    builders: BTreeMap<&'static str, Builder>,
}

impl StrategyRegistry {
    /// Registry with the built-in rule sets.
    pub fn builtin() -> Self {
        let mut registry = Self {
            builders: BTreeMap::new(),
        };
        registry.register("trend_follow", |s| {
            Box::new(TrendFollower::new(
                "trend_follow",
                TrendParams::default().with_overrides(s),
            ))
        });
        registry.register("trend_follow_aggressive", |s| {
            Box::new(TrendFollower::new(
                "trend_follow_aggressive",
                TrendParams::aggressive().with_overrides(s),
            ))
        });
        registry
    }

    pub fn register(&mut self, id: &'static str, builder: Builder) {
        self.builders.insert(id, builder);
    }

    /// Build the generator named by `settings.id`.
    pub fn build(&self, settings: &StrategySettings) -> Result<Box<dyn SignalGenerator>> {
        let builder = self.builders.get(settings.id.as_str()).ok_or_else(|| {
            anyhow!(
                "Unknown strategy '{}' (known: {})",
                settings.id,
                self.ids().join(", ")
            )
        })?;
        Ok(builder(settings))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }
}
