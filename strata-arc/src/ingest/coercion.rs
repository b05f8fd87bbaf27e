//! Attribute coercion
//!
//! Rewrites incoming datasets before they touch the database. Rules come
//! from the configuration and are selected by the sender's AE title.

use crate::error::ArcResult;
use crate::ingest::dataset::Dataset;
use strata_common::config::CoercionRule;

pub trait AttributeCoercion: Send + Sync {
    /// Rewrite `dataset` in place, returning the number of attributes changed
    fn coerce(&self, source_aet: &str, dataset: &mut Dataset) -> ArcResult<usize>;
}

/// Applies every configured rule matching the source AE, in order
#[derive(Debug, Clone, Default)]
pub struct RuleBasedCoercion {
    rules: Vec<CoercionRule>,
}

impl RuleBasedCoercion {
    pub fn new(rules: Vec<CoercionRule>) -> Self {
        Self { rules }
    }

    fn matches(rule: &CoercionRule, source_aet: &str) -> bool {
        rule.source_ae_titles.is_empty() || rule.source_ae_titles.iter().any(|a| a == source_aet)
    }
}

impl AttributeCoercion for RuleBasedCoercion {
    fn coerce(&self, source_aet: &str, dataset: &mut Dataset) -> ArcResult<usize> {
        let mut changed = 0;
        for rule in self.rules.iter().filter(|r| Self::matches(r, source_aet)) {
            for keyword in &rule.remove {
                if dataset.remove(keyword) {
                    changed += 1;
                }
            }
            for (keyword, value) in &rule.set {
                if dataset.string(keyword).as_deref() != Some(value.as_str()) {
                    dataset.set_string(keyword, value);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}
