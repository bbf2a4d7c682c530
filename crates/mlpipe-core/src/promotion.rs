//! Model promotion: decide whether a newly registered version replaces the
//! production model, then apply the stage and alias transitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::registry::{ModelRegistry, ModelVersion, Stage};

pub const DECISION_TAG: &str = "promotion_decision";
pub const REASON_TAG: &str = "promotion_reason";

/// Score differences below this are treated as ties.
const SCORE_EPSILON: f64 = 1e-9;

/// How candidates are compared against the production model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionPolicy {
    /// Metric both versions are judged on
    pub metric: String,
    pub higher_is_better: bool,
    /// Minimum gain over production, in the metric's direction
    pub min_improvement: f64,
    pub production_alias: String,
    pub staging_alias: String,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            metric: "test_accuracy".to_string(),
            higher_is_better: true,
            min_improvement: 0.0,
            production_alias: "production".to_string(),
            staging_alias: "staging".to_string(),
        }
    }
}

impl PromotionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.metric.is_empty() {
            return Err(PipelineError::InvalidParam(
                "promotion.metric must not be empty".to_string(),
            ));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(PipelineError::InvalidParam(format!(
                "promotion.min_improvement must be a non-negative number, got {}",
                self.min_improvement
            )));
        }
        if self.production_alias == self.staging_alias {
            return Err(PipelineError::InvalidParam(
                "production and staging aliases must differ".to_string(),
            ));
        }
        Ok(())
    }

    fn score(&self, metrics: &HashMap<String, f64>) -> Option<f64> {
        metrics.get(&self.metric).copied().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PromotionAction {
    /// Make the candidate the production model, archiving `archive` if set.
    Promote { archive: Option<u32> },
    /// Keep the incumbent and park the candidate in staging.
    Stage,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromotionDecision {
    #[serde(flatten)]
    pub action: PromotionAction,
    pub reason: String,
    pub candidate_score: Option<f64>,
    pub incumbent_score: Option<f64>,
}

impl PromotionDecision {
    pub fn is_promote(&self) -> bool {
        matches!(self.action, PromotionAction::Promote { .. })
    }

    pub fn label(&self) -> &'static str {
        match self.action {
            PromotionAction::Promote { .. } => "promote",
            PromotionAction::Stage => "stage",
        }
    }
}

/// Decide the fate of a candidate given its metrics and, if any, the current
/// production version with its metrics.
///
/// Non-finite metric values count as missing. Ties keep the incumbent.
pub fn decide(
    policy: &PromotionPolicy,
    candidate_metrics: &HashMap<String, f64>,
    incumbent: Option<(&ModelVersion, &HashMap<String, f64>)>,
) -> PromotionDecision {
    let candidate_score = policy.score(candidate_metrics);

    let Some((incumbent, incumbent_metrics)) = incumbent else {
        return PromotionDecision {
            action: PromotionAction::Promote { archive: None },
            reason: "no production model".to_string(),
            candidate_score,
            incumbent_score: None,
        };
    };
    let incumbent_score = policy.score(incumbent_metrics);

    let Some(candidate) = candidate_score else {
        return PromotionDecision {
            action: PromotionAction::Stage,
            reason: format!("candidate has no '{}' metric", policy.metric),
            candidate_score,
            incumbent_score,
        };
    };

    let Some(current) = incumbent_score else {
        return PromotionDecision {
            action: PromotionAction::Promote {
                archive: Some(incumbent.version),
            },
            reason: format!(
                "production v{} has no '{}' metric",
                incumbent.version, policy.metric
            ),
            candidate_score,
            incumbent_score,
        };
    };

    let gain = if policy.higher_is_better {
        candidate - current
    } else {
        current - candidate
    };

    if gain > SCORE_EPSILON && gain + SCORE_EPSILON >= policy.min_improvement {
        PromotionDecision {
            action: PromotionAction::Promote {
                archive: Some(incumbent.version),
            },
            reason: format!(
                "{} {:.4} beats production v{} ({:.4}) by {:.4}",
                policy.metric, candidate, incumbent.version, current, gain
            ),
            candidate_score,
            incumbent_score,
        }
    } else {
        PromotionDecision {
            action: PromotionAction::Stage,
            reason: format!(
                "{} {:.4} does not improve on production v{} ({:.4}) by at least {:.4}",
                policy.metric, candidate, incumbent.version, current, policy.min_improvement
            ),
            candidate_score,
            incumbent_score,
        }
    }
}

/// The version currently serving production: the holder of the production
/// alias, else the newest version in the Production stage.
pub fn current_production<R: ModelRegistry + ?Sized>(
    registry: &R,
    model: &str,
    policy: &PromotionPolicy,
) -> Result<Option<ModelVersion>> {
    match registry.get_version_by_alias(model, &policy.production_alias) {
        Ok(mv) => Ok(Some(mv)),
        Err(PipelineError::AliasNotFound { .. }) => {
            registry.latest_version(model, Stage::Production)
        }
        Err(PipelineError::ModelNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Apply `decision` to `candidate` in the registry. Returns the updated version.
pub fn apply<R: ModelRegistry + ?Sized>(
    registry: &R,
    model: &str,
    candidate: u32,
    decision: &PromotionDecision,
    policy: &PromotionPolicy,
) -> Result<ModelVersion> {
    match &decision.action {
        PromotionAction::Promote { archive } => {
            registry.transition_stage(model, candidate, Stage::Production, true)?;
            // An incumbent found only through its alias may sit in another stage
            if let Some(old) = (*archive).filter(|v| *v != candidate) {
                let previous = registry.get_model_version(model, old)?;
                if previous.stage != Stage::Archived {
                    registry.transition_stage(model, old, Stage::Archived, false)?;
                }
            }
            registry.set_alias(model, &policy.production_alias, candidate)?;
            let current = registry.get_model_version(model, candidate)?;
            if current.aliases.contains(&policy.staging_alias) {
                registry.delete_alias(model, &policy.staging_alias)?;
            }
            info!(model = %model, version = candidate, archived = ?archive, "Promoted to production");
        }
        PromotionAction::Stage => {
            registry.transition_stage(model, candidate, Stage::Staging, false)?;
            registry.set_alias(model, &policy.staging_alias, candidate)?;
            info!(model = %model, version = candidate, "Kept in staging");
        }
    }

    registry.set_version_tag(model, candidate, DECISION_TAG, decision.label())?;
    registry.set_version_tag(model, candidate, REASON_TAG, &decision.reason)?;
    registry.get_model_version(model, candidate)
}
