//! Predefined research workflows

use crate::{Error, Result};
use agent_relay_core::orchestration::{AggregatedResults, ExecutionMode, Phase, StepSpec, WorkflowPlan};
use agent_relay_core::task::InputData;
use serde_json::{json, Value};

const DUE_DILIGENCE: &str = "due_diligence";
const IDEA_GENERATION: &str = "idea_generation";

/// Candidates taken from a screen into due diligence
const TOP_PURE_PLAYS: usize = 5;
const TOP_CLUSTERS: usize = 10;

pub const WORKFLOW_NAMES: &[&str] = &[
    "quick_research",
    "standard_research",
    "thematic_idea_generation",
    "institutional_clustering",
    "daily_market_scan",
];

/// Build a named plan from its input
pub fn plan_by_name(name: &str, input: &InputData) -> Result<WorkflowPlan> {
    match name {
        "quick_research" => Ok(quick_research(&required_str(input, "ticker")?)),
        "standard_research" => Ok(standard_research(&required_str(input, "ticker")?)),
        "thematic_idea_generation" => Ok(thematic_idea_generation(
            &required_str(input, "theme")?,
            input.get("sector").and_then(Value::as_str),
        )),
        "institutional_clustering" => Ok(institutional_clustering()),
        "daily_market_scan" => Ok(daily_market_scan()),
        other => Err(Error::configuration(format!(
            "unknown workflow '{}'; expected one of: {}",
            other,
            WORKFLOW_NAMES.join(", ")
        ))),
    }
}

fn required_str(input: &InputData, field: &str) -> Result<String> {
    input
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            agent_relay_core::Error::validation(format!("workflow input requires '{}'", field))
                .into()
        })
}

fn dd_step(key: &str, operation: &str, ticker: &str) -> StepSpec {
    StepSpec::new(key, DUE_DILIGENCE, operation).input("ticker", json!(ticker))
}

/// Business overview, then a risk assessment
///
/// A failed overview skips the risk assessment.
pub fn quick_research(ticker: &str) -> WorkflowPlan {
    WorkflowPlan::new("quick_research")
        .phase(
            Phase::sequential(
                "overview",
                vec![dd_step("business_overview", "business_overview_report", ticker)],
            )
            .required(),
        )
        .phase(Phase::sequential(
            "risks",
            vec![dd_step("risk_assessment", "risk_assessment", ticker)],
        ))
}

/// Seven due diligence sections, one after another
pub fn standard_research(ticker: &str) -> WorkflowPlan {
    let sections = [
        ("business_overview", "business_overview_report"),
        ("business_economics", "business_economics"),
        ("industry_overview", "industry_overview"),
        ("competitive_landscape", "competitive_landscape"),
        ("financial_analysis", "financial_statement_analysis"),
        ("risk_assessment", "risk_assessment"),
        ("valuation", "dcf_valuation"),
    ];
    WorkflowPlan::new("standard_research").phase(Phase::sequential(
        "due_diligence",
        sections
            .iter()
            .map(|(key, operation)| dd_step(key, operation, ticker))
            .collect(),
    ))
}

/// Theme analysis, candidate screen, pure-play filter, then an overview of
/// the strongest pure plays
pub fn thematic_idea_generation(theme: &str, sector: Option<&str>) -> WorkflowPlan {
    let mut screen = StepSpec::new("candidates", IDEA_GENERATION, "thematic_candidate_screen")
        .input("theme", json!(theme));
    if let Some(sector) = sector {
        screen = screen.input("sector", json!(sector));
    }

    let filter_theme = theme.to_string();
    WorkflowPlan::new("thematic_idea_generation")
        .phase(Phase::sequential(
            "theme_analysis",
            vec![StepSpec::new("theme_analysis", IDEA_GENERATION, "theme_order_effects")
                .input("theme", json!(theme))],
        ))
        .phase(Phase::sequential("screen", vec![screen]).required())
        .phase(Phase::derived(
            "pure_play_filter",
            ExecutionMode::Sequential,
            move |sections| {
                let candidates = sections
                    .data("candidates")
                    .and_then(|data| data.get("candidates"))
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                vec![StepSpec::new("pure_plays", IDEA_GENERATION, "pure_play_filter")
                    .input("theme", json!(filter_theme))
                    .input("candidates", candidates)]
            },
        ))
        .phase(Phase::derived(
            "candidate_overviews",
            ExecutionMode::Parallel,
            |sections| {
                tickers_from(sections, "pure_plays", "pure_plays", TOP_PURE_PLAYS)
                    .into_iter()
                    .map(|ticker| {
                        dd_step(&format!("overview_{}", ticker), "business_overview_report", &ticker)
                    })
                    .collect()
            },
        ))
}

/// 13F clustering, then insider activity for the most clustered names
pub fn institutional_clustering() -> WorkflowPlan {
    WorkflowPlan::new("institutional_clustering")
        .phase(
            Phase::sequential(
                "clustering",
                vec![StepSpec::new("clustering", IDEA_GENERATION, "institutional_clustering_13f")],
            )
            .required(),
        )
        .phase(Phase::derived("insider_overlay", ExecutionMode::Parallel, |sections| {
            tickers_from(sections, "clustering", "clusters", TOP_CLUSTERS)
                .into_iter()
                .map(|ticker| {
                    StepSpec::new(
                        format!("insider_{}", ticker),
                        IDEA_GENERATION,
                        "insider_trading_analysis",
                    )
                    .input("ticker", json!(ticker))
                })
                .collect()
        }))
}

/// Four independent idea scans issued together; results are never cached
/// so each scan reflects the day it runs
pub fn daily_market_scan() -> WorkflowPlan {
    let scans = [
        ("institutional", "institutional_clustering_13f"),
        ("sentiment", "social_sentiment_scan"),
        ("newsletters", "newsletter_idea_scraping"),
        ("contrarian", "contrarian_opportunities"),
    ];
    WorkflowPlan::new("daily_market_scan").phase(Phase::parallel(
        "scan",
        scans
            .iter()
            .map(|(key, operation)| StepSpec::new(*key, IDEA_GENERATION, *operation).uncached())
            .collect(),
    ))
}

/// Distinct upper-cased tickers from `section.data[list_field][*].ticker`,
/// in order, at most `limit`
fn tickers_from(
    sections: &AggregatedResults,
    section: &str,
    list_field: &str,
    limit: usize,
) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    let entries = sections
        .data(section)
        .and_then(|data| data.get(list_field))
        .and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let Some(ticker) = entry.get("ticker").and_then(Value::as_str) else {
            continue;
        };
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() || tickers.contains(&ticker) {
            continue;
        }
        tickers.push(ticker);
        if tickers.len() == limit {
            break;
        }
    }
    tickers
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::orchestration::SectionOutcome;
    use agent_relay_core::task::TaskResult;
    use serde_json::Map;
    use std::time::Duration;
    use uuid::Uuid;

    fn input(value: Value) -> InputData {
        value.as_object().cloned().unwrap_or_else(Map::new)
    }

    fn success(data: Value) -> SectionOutcome {
        SectionOutcome::from_result(TaskResult::success(
            Uuid::new_v4(),
            IDEA_GENERATION,
            data,
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_quick_research_shape() {
        let plan = plan_by_name("quick_research", &input(json!({"ticker": "AAPL"}))).unwrap();
        let phases = plan.phases();
        assert_eq!(phases.len(), 2);
        assert!(phases[0].is_required());

        let steps = phases[0].steps(&AggregatedResults::new());
        assert_eq!(steps[0].operation_name, "business_overview_report");
        assert_eq!(steps[0].input_data.get("ticker"), Some(&json!("AAPL")));
    }

    #[test]
    fn test_standard_research_has_seven_sequential_sections() {
        let plan = standard_research("MSFT");
        let phase = &plan.phases()[0];
        assert_eq!(phase.mode(), ExecutionMode::Sequential);
        let keys: Vec<String> = phase
            .steps(&AggregatedResults::new())
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], "business_overview");
        assert_eq!(keys[6], "valuation");
    }

    #[test]
    fn test_thematic_phases_feed_each_other() {
        let plan = thematic_idea_generation("grid storage", Some("Utilities"));
        let phases = plan.phases();
        assert_eq!(phases.len(), 4);

        let mut sections = AggregatedResults::new();
        sections.insert(
            "candidates",
            success(json!({"candidates": [{"ticker": "FLNC"}, {"ticker": "STEM"}]})),
        );
        let filter = phases[2].steps(&sections);
        assert_eq!(
            filter[0].input_data.get("candidates"),
            Some(&json!([{"ticker": "FLNC"}, {"ticker": "STEM"}]))
        );

        sections.insert(
            "pure_plays",
            success(json!({"pure_plays": [
                {"ticker": "flnc"}, {"ticker": "FLNC"}, {"name": "no ticker"},
                {"ticker": "STEM"}, {"ticker": "ENPH"}, {"ticker": "EOSE"},
                {"ticker": "FREY"}, {"ticker": "AMRC"}
            ]})),
        );
        let overviews = phases[3].steps(&sections);
        let keys: Vec<&str> = overviews.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["overview_FLNC", "overview_STEM", "overview_ENPH", "overview_EOSE", "overview_FREY"]
        );
    }

    #[test]
    fn test_thematic_without_screen_results() {
        let plan = thematic_idea_generation("space", None);
        let sections = AggregatedResults::new();
        let filter = plan.phases()[2].steps(&sections);
        assert_eq!(filter[0].input_data.get("candidates"), Some(&json!([])));
        assert!(plan.phases()[3].steps(&sections).is_empty());
    }

    #[test]
    fn test_daily_scan_is_parallel_and_uncached() {
        let plan = daily_market_scan();
        let phase = &plan.phases()[0];
        assert_eq!(phase.mode(), ExecutionMode::Parallel);
        let steps = phase.steps(&AggregatedResults::new());
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| !s.cached));
    }

    #[test]
    fn test_missing_input_and_unknown_name() {
        assert!(matches!(
            plan_by_name("quick_research", &InputData::new()),
            Err(Error::Core(agent_relay_core::Error::Validation { .. }))
        ));
        assert!(matches!(
            plan_by_name("moonshot", &InputData::new()),
            Err(Error::Configuration(_))
        ));
    }
}
