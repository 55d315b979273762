//! Capability sets of the analysis agents
//!
//! Each agent type gets one [`PromptOperationHandler`] per named operation
//! plus a fallback for names it does not list, so new analyses only need a
//! prompt template.

use crate::handlers::PromptOperationHandler;
use crate::{Error, Result};
use agent_relay_core::CapabilitySet;
use agent_relay_llm::GenerationService;
use agent_relay_prompts::PromptLibrary;
use serde_json::{json, Value};
use std::sync::Arc;

/// A named operation and the input fields it cannot run without
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

const fn op(name: &'static str, required: &'static [&'static str]) -> OperationSpec {
    OperationSpec { name, required }
}

const TICKER: &[&str] = &["ticker"];
const THEME: &[&str] = &["theme"];
const NONE: &[&str] = &[];

pub const DUE_DILIGENCE: &[OperationSpec] = &[
    op("business_overview_report", TICKER),
    op("business_economics", TICKER),
    op("growth_margin_drivers", TICKER),
    op("industry_overview", TICKER),
    op("financial_statement_analysis", TICKER),
    op("earnings_quality", TICKER),
    op("competitive_landscape", TICKER),
    op("management_quality_assessment", TICKER),
    op("risk_assessment", TICKER),
    op("dcf_valuation", TICKER),
    op("bear_case_analysis", TICKER),
];

pub const IDEA_GENERATION: &[OperationSpec] = &[
    op("thematic_candidate_screen", THEME),
    op("theme_order_effects", THEME),
    op("institutional_clustering_13f", NONE),
    op("insider_trading_analysis", NONE),
    op("pure_play_filter", THEME),
    op("newsletter_idea_scraping", NONE),
    op("social_sentiment_scan", NONE),
    op("contrarian_opportunities", NONE),
];

pub const MACRO_ANALYSIS: &[OperationSpec] = &[
    op("market_regime_classification", NONE),
    op("economic_indicator_analysis", NONE),
];

pub const PORTFOLIO_MANAGEMENT: &[OperationSpec] = &[
    op("portfolio_risk_analysis", &["holdings"]),
    op("position_sizing", TICKER),
    op("correlation_analysis", &["holdings"]),
    op("rebalancing_recommendation", &["holdings"]),
    op("sector_exposure", &["holdings"]),
];

pub const RISK_ANALYSIS: &[OperationSpec] = &[
    op("company_risk_assessment", TICKER),
    op("stress_test", NONE),
];

pub const SENTIMENT_ANALYSIS: &[OperationSpec] = &[
    op("social_sentiment_scan", NONE),
    op("insider_trading_analysis", NONE),
    op("newsletter_idea_scraping", NONE),
];

/// Known agent types, in the order `worker --help` lists them
pub const AGENT_TYPES: &[&str] = &[
    "due_diligence",
    "idea_generation",
    "macro_analysis",
    "portfolio_management",
    "risk_analysis",
    "sentiment_analysis",
];

/// Operation table of an agent type
pub fn operations_for(agent_type: &str) -> Option<&'static [OperationSpec]> {
    match agent_type {
        "due_diligence" => Some(DUE_DILIGENCE),
        "idea_generation" => Some(IDEA_GENERATION),
        "macro_analysis" => Some(MACRO_ANALYSIS),
        "portfolio_management" => Some(PORTFOLIO_MANAGEMENT),
        "risk_analysis" => Some(RISK_ANALYSIS),
        "sentiment_analysis" => Some(SENTIMENT_ANALYSIS),
        _ => None,
    }
}

/// Output shape requested for operations whose results later phases read
fn output_schema(operation: &str) -> Option<Value> {
    match operation {
        "thematic_candidate_screen" => Some(json!({
            "theme_analysis": {"description": "string", "growth_drivers": ["string"]},
            "candidates": [{
                "ticker": "string",
                "company_name": "string",
                "thesis": "string",
                "revenue_exposure_pct": "number",
                "conviction_score": "number"
            }]
        })),
        "pure_play_filter" => Some(json!({
            "pure_plays": [{
                "ticker": "string",
                "revenue_exposure_pct": "number",
                "pure_play_score": "number",
                "rationale": "string"
            }]
        })),
        "institutional_clustering_13f" => Some(json!({
            "clusters": [{"ticker": "string", "institutions": ["string"], "signal_strength": "number"}]
        })),
        _ => None,
    }
}

/// Build the capability set of `agent_type`
pub fn capability_set(
    agent_type: &str,
    library: Arc<PromptLibrary>,
    generation: Arc<GenerationService>,
) -> Result<CapabilitySet> {
    let operations = operations_for(agent_type).ok_or_else(|| {
        Error::configuration(format!(
            "unknown agent type '{}'; expected one of: {}",
            agent_type,
            AGENT_TYPES.join(", ")
        ))
    })?;

    let mut capabilities = CapabilitySet::new(agent_type);
    for spec in operations {
        let mut handler =
            PromptOperationHandler::new(agent_type, library.clone(), generation.clone())
                .require(spec.required);
        if let Some(schema) = output_schema(spec.name) {
            handler = handler.with_schema(schema);
        }
        capabilities = capabilities.operation(spec.name, handler);
    }

    Ok(capabilities.fallback(PromptOperationHandler::new(agent_type, library, generation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::CannedProvider;
    use agent_relay_core::OperationHandler;

    fn build(agent_type: &str) -> Result<CapabilitySet> {
        capability_set(
            agent_type,
            Arc::new(PromptLibrary::new()),
            Arc::new(GenerationService::new(CannedProvider::new("{}"))),
        )
    }

    #[test]
    fn test_every_agent_type_builds() {
        for agent_type in AGENT_TYPES {
            let capabilities = build(agent_type).unwrap();
            assert_eq!(capabilities.agent_type(), *agent_type);
            let registry = capabilities.registry();
            assert!(registry.has_fallback());
            for spec in operations_for(agent_type).unwrap() {
                assert!(registry.contains(spec.name), "{} lacks {}", agent_type, spec.name);
            }
        }
    }

    #[test]
    fn test_required_fields_are_attached() {
        let capabilities = build("due_diligence").unwrap();
        let handler = capabilities.registry().resolve("dcf_valuation").unwrap();
        assert_eq!(handler.required_fields(), &["ticker"]);

        let fallback = capabilities.registry().resolve("value_chain_mapping").unwrap();
        assert!(fallback.required_fields().is_empty());
    }

    #[test]
    fn test_unknown_agent_type() {
        assert!(matches!(build("astrology"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_operation_names_are_unique_per_agent() {
        for agent_type in AGENT_TYPES {
            let mut names: Vec<_> = operations_for(agent_type).unwrap().iter().map(|s| s.name).collect();
            let count = names.len();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), count, "duplicate operation in {}", agent_type);
        }
    }
}
