//! Model router: picks a tier per node from node type and live budget
//! pressure, and pre-checks dispatch affordability with automatic
//! downgrade.

use relay_store::models::{BudgetEnvelope, ModelTier, NodeKind};
use tracing::debug;

use crate::pricing::estimate_cost;

/// Outcome of a pre-dispatch budget check.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    /// A cheaper tier that fits, when the requested one does not.
    pub suggested_model: Option<ModelTier>,
}

impl BudgetCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            suggested_model: None,
        }
    }

    fn allow_with(model: ModelTier) -> Self {
        Self {
            allowed: true,
            reason: None,
            suggested_model: Some(model),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            suggested_model: None,
        }
    }
}

/// Tier selection and affordability checks.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    /// Remaining-budget-per-node floor below which the cheapest tier is
    /// forced.
    pub pressure_threshold_usd: f64,
    /// Remaining budget below which dispatch is rejected outright.
    pub min_dispatch_usd: f64,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self {
            pressure_threshold_usd: 0.20,
            min_dispatch_usd: 0.05,
        }
    }
}

impl ModelRouter {
    /// Per-type default tier.
    pub fn default_tier(kind: NodeKind) -> ModelTier {
        match kind {
            NodeKind::Code => ModelTier::Opus,
            NodeKind::Synthesize => ModelTier::Sonnet,
            NodeKind::Validate => ModelTier::Haiku,
            NodeKind::Research => ModelTier::Sonnet,
        }
    }

    /// Pick the tier for one node.
    ///
    /// An explicit override always wins. Otherwise the average remaining
    /// budget per node decides: under pressure the cheapest tier is forced,
    /// else the per-type default applies.
    pub fn select(
        &self,
        kind: NodeKind,
        budget: &BudgetEnvelope,
        explicit: Option<ModelTier>,
    ) -> ModelTier {
        if let Some(tier) = explicit {
            return tier;
        }

        let per_node = budget.remaining_usd() / budget.max_nodes.max(1) as f64;
        if per_node < self.pressure_threshold_usd {
            debug!(
                per_node_usd = per_node,
                threshold = self.pressure_threshold_usd,
                "budget pressure: forcing cheapest tier"
            );
            return ModelTier::cheapest();
        }

        Self::default_tier(kind)
    }

    /// Check whether dispatching `kind` on `model` fits the remaining
    /// budget, walking down to cheaper tiers when it does not.
    pub fn check(&self, kind: NodeKind, model: ModelTier, budget: &BudgetEnvelope) -> BudgetCheck {
        let remaining = budget.remaining_usd();

        if remaining < self.min_dispatch_usd {
            return BudgetCheck::reject(format!(
                "remaining budget ${remaining:.2} below dispatch floor ${:.2}",
                self.min_dispatch_usd
            ));
        }

        if estimate_cost(kind, model) <= remaining {
            return BudgetCheck::allow();
        }

        // Try cheaper tiers in order.
        let mut candidate = model.next_cheaper();
        while let Some(tier) = candidate {
            if estimate_cost(kind, tier) <= remaining {
                return BudgetCheck::allow_with(tier);
            }
            candidate = tier.next_cheaper();
        }

        BudgetCheck::reject(format!(
            "no tier fits remaining budget ${remaining:.2} for {kind} (cheapest estimate ${:.2})",
            estimate_cost(kind, ModelTier::cheapest())
        ))
    }
}
