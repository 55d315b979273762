//! End-to-end dispatch tests over the in-memory broker
//!
//! Workers and dispatchers share one `RelayContext`, so every message
//! travels through the same channel fabric a networked deployment uses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::config::Settings;
use agent_relay_core::orchestration::{StepSpec, WorkflowOrchestrator};
use agent_relay_core::task::{ErrorKind, InputData, TaskStatus};
use agent_relay_core::worker::{handler_fn, HandlerOutput, TaskContext};
use agent_relay_core::{CapabilitySet, Dispatcher, RelayContext, WorkerRuntime};
use serde_json::{json, Value};

fn input(value: Value) -> InputData {
    match value {
        Value::Object(map) => map,
        _ => InputData::new(),
    }
}

async fn start_worker(ctx: &RelayContext, capabilities: CapabilitySet) {
    let runtime = Arc::new(WorkerRuntime::new(ctx, capabilities));
    runtime.spawn().await.unwrap();
}

fn due_diligence(delay: Duration) -> CapabilitySet {
    CapabilitySet::new("due_diligence").operation(
        "business_overview_report",
        handler_fn(move |ctx: TaskContext| async move {
            let ticker = ctx.get("ticker").and_then(Value::as_str).unwrap_or_default().to_string();
            tokio::time::sleep(delay).await;
            Ok(HandlerOutput::new(json!({
                "ticker": ticker,
                "summary": "Designs consumer hardware and services",
            }))
            .with_usage(812, "gpt-4-turbo-preview"))
        })
        .require(&["ticker"]),
    )
}

#[tokio::test(start_paused = true)]
async fn business_overview_round_trip() {
    let ctx = RelayContext::in_memory(Settings::default());
    start_worker(&ctx, due_diligence(Duration::from_secs(2))).await;
    let dispatcher = Dispatcher::new(&ctx);

    let result = dispatcher
        .dispatch(
            "due_diligence",
            "business_overview_report",
            input(json!({"ticker": "AAPL"})),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.as_ref().unwrap()["ticker"], "AAPL");
    assert_eq!(result.tokens_used, 812);
    assert_eq!(result.model_used, "gpt-4-turbo-preview");
    assert!(result.execution_time_seconds >= 2.0);

    let record = ctx
        .ledger
        .as_ref()
        .unwrap()
        .get(result.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn slow_worker_times_out_and_late_reply_is_dropped() {
    let ctx = RelayContext::in_memory(Settings::default());
    start_worker(&ctx, due_diligence(Duration::from_secs(10))).await;
    let dispatcher = Dispatcher::new(&ctx);

    let started = tokio::time::Instant::now();
    let result = dispatcher
        .dispatch(
            "due_diligence",
            "business_overview_report",
            input(json!({"ticker": "MSFT"})),
            Duration::from_secs(3),
        )
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(result.error.as_deref(), Some("Task timeout after 3.0s"));

    // The worker still finishes; its reply goes to a channel nobody holds
    tokio::time::sleep(Duration::from_secs(8)).await;
    let record = ctx
        .ledger
        .as_ref()
        .unwrap()
        .get(result.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn timeout_without_worker_is_punctual() {
    let ctx = RelayContext::in_memory(Settings::default());
    let dispatcher = Dispatcher::new(&ctx);

    let started = std::time::Instant::now();
    let result = dispatcher
        .dispatch("nobody", "noop", InputData::new(), Duration::from_secs(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(result.is_timeout());
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(1100), "{:?}", elapsed);
}

#[tokio::test]
async fn concurrent_dispatches_receive_their_own_replies() {
    let ctx = RelayContext::in_memory(Settings::default());
    let echo = CapabilitySet::new("echo").operation(
        "echo",
        handler_fn(|ctx: TaskContext| async move {
            let n = ctx.get("n").cloned().unwrap_or(Value::Null);
            // Reverse completion order relative to dispatch order
            let wait = 50u64.saturating_sub(n.as_u64().unwrap_or(0) * 5);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            Ok(HandlerOutput::new(json!({ "n": n })))
        }),
    );
    start_worker(&ctx, echo).await;
    let dispatcher = Arc::new(Dispatcher::new(&ctx));

    let calls = (0..10u64).map(|n| {
        let dispatcher = dispatcher.clone();
        async move {
            let result = dispatcher
                .dispatch("echo", "echo", input(json!({ "n": n })), Duration::from_secs(5))
                .await
                .unwrap();
            (n, result)
        }
    });

    for (n, result) in futures::future::join_all(calls).await {
        assert!(result.success);
        assert_eq!(result.data.unwrap()["n"], n);
    }
}

#[tokio::test]
async fn identical_cached_steps_run_once() {
    let ctx = RelayContext::in_memory(Settings::default());
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let risk = CapabilitySet::new("risk_analysis").operation(
        "risk_assessment",
        handler_fn(move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(HandlerOutput::new(json!({"risk": "moderate"})))
            }
        }),
    );
    start_worker(&ctx, risk).await;

    let dispatcher = Arc::new(Dispatcher::new(&ctx));
    let orchestrator = WorkflowOrchestrator::new(&ctx, dispatcher.clone());

    let steps = vec![
        StepSpec::new("first", "risk_analysis", "risk_assessment").input("ticker", json!("NVDA")),
        StepSpec::new("second", "risk_analysis", "risk_assessment").input("ticker", json!("NVDA")),
    ];
    let sections = orchestrator.fan_out(steps).await;
    assert_eq!(sections.summary().successful, 2);

    let again = dispatcher
        .dispatch_cached(
            "risk_analysis",
            "risk_assessment",
            input(json!({"ticker": "NVDA"})),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert!(again.success);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fan_out_keeps_failures_in_their_slots() {
    let ctx = RelayContext::in_memory(Settings::default());
    let scan = CapabilitySet::new("macro_analysis").fallback(handler_fn(|ctx: TaskContext| async move {
        match ctx.get("region").and_then(Value::as_str) {
            Some("EU") | Some("JP") => Err(agent_relay_core::Error::handler("no data for region")),
            Some(region) => Ok(HandlerOutput::new(json!({ "region": region }))),
            None => Err(agent_relay_core::Error::validation("region required")),
        }
    }));
    start_worker(&ctx, scan).await;

    let orchestrator = WorkflowOrchestrator::new(&ctx, Arc::new(Dispatcher::new(&ctx)));
    let steps = ["US", "EU", "CN", "JP", "UK"]
        .iter()
        .map(|region| {
            StepSpec::new(*region, "macro_analysis", "economic_indicators")
                .input("region", json!(region))
                .uncached()
        })
        .collect();

    let sections = orchestrator.fan_out(steps).await;
    assert_eq!(
        sections.keys().collect::<Vec<_>>(),
        vec!["US", "EU", "CN", "JP", "UK"]
    );
    let summary = sections.summary();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.failed, 2);

    let value = sections.to_value();
    assert_eq!(value["EU"], json!({"error": "Handler error: no data for region"}));
    assert_eq!(value["UK"]["region"], "UK");
}
