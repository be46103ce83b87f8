//! Strategy registry

use super::{Breakout, Strategy};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds a strategy from its config params
pub type StrategyConstructor = fn(&HashMap<String, f64>) -> anyhow::Result<Arc<dyn Strategy>>;

/// Name to constructor map, populated once at startup
pub struct StrategyRegistry {
    constructors: BTreeMap<&'static str, StrategyConstructor>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in strategy
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("breakout", breakout);
        registry
    }

    /// Returns false if the name was already taken
    pub fn register(&mut self, name: &'static str, constructor: StrategyConstructor) -> bool {
        if self.constructors.contains_key(name) {
            tracing::warn!(name, "Strategy already registered");
            return false;
        }
        self.constructors.insert(name, constructor);
        true
    }

    pub fn create(&self, name: &str, params: &HashMap<String, f64>) -> anyhow::Result<Arc<dyn Strategy>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown strategy '{}', available: {}",
                name,
                self.names().join(", ")
            )
        })?;
        constructor(params)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

fn breakout(params: &HashMap<String, f64>) -> anyhow::Result<Arc<dyn Strategy>> {
    Ok(Arc::new(Breakout::from_params(params)?))
}
