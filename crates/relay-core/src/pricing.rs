//! Model pricing: streamed token rates and per-node cost estimates.

use relay_store::models::{ModelTier, NodeKind};

/// USD per million tokens, `(input, output)`.
pub fn token_rates(model: ModelTier) -> (f64, f64) {
    match model {
        ModelTier::Haiku => (0.80, 4.00),
        ModelTier::Sonnet => (3.00, 15.00),
        ModelTier::Opus => (15.00, 75.00),
    }
}

/// Cost of one result record: `(in · inRate + out · outRate) / 1e6`.
pub fn stream_cost(model: ModelTier, input_tokens: u64, output_tokens: u64) -> f64 {
    let (in_rate, out_rate) = token_rates(model);
    (input_tokens as f64 * in_rate + output_tokens as f64 * out_rate) / 1_000_000.0
}

/// Fallback estimate for a `(node type, model)` combination not in the table.
pub const DEFAULT_ESTIMATE_USD: f64 = 0.20;

/// Fixed per-`(node type, model)` estimates in USD.
const ESTIMATE_TABLE: &[(NodeKind, ModelTier, f64)] = &[
    (NodeKind::Research, ModelTier::Haiku, 0.02),
    (NodeKind::Research, ModelTier::Sonnet, 0.10),
    (NodeKind::Research, ModelTier::Opus, 0.50),
    (NodeKind::Code, ModelTier::Haiku, 0.05),
    (NodeKind::Code, ModelTier::Sonnet, 0.25),
    (NodeKind::Code, ModelTier::Opus, 1.00),
    (NodeKind::Synthesize, ModelTier::Haiku, 0.02),
    (NodeKind::Synthesize, ModelTier::Sonnet, 0.08),
    (NodeKind::Synthesize, ModelTier::Opus, 0.40),
    (NodeKind::Validate, ModelTier::Haiku, 0.01),
    (NodeKind::Validate, ModelTier::Sonnet, 0.05),
    (NodeKind::Validate, ModelTier::Opus, 0.25),
];

/// Expected cost in USD of one node of `kind` run on `model`.
pub fn estimate_cost(kind: NodeKind, model: ModelTier) -> f64 {
    ESTIMATE_TABLE
        .iter()
        .find(|(k, m, _)| *k == kind && *m == model)
        .map(|(_, _, usd)| *usd)
        .unwrap_or(DEFAULT_ESTIMATE_USD)
}
