use serde_json::json;

use storyloom::pipeline::prompts::{CONSISTENCY_SYSTEM, DIRECTOR_SYSTEM, WRITER_SYSTEM};
use storyloom::types::{ERROR_MARKER, IssueKind, Severity, Stage};
use storyloom::{EngineRequest, RequestContext, UserTier};

use super::engine_harness::{ScriptedChat, WRITER_REPLY, test_engine};

const STAGES: [&str; 8] = [
    "validate",
    "understand",
    "retrieve",
    "assemble",
    "plan",
    "write",
    "check",
    "respond",
];

#[tokio::test]
async fn generate_runs_every_stage_and_grounds_the_writer() {
    let t = test_engine(ScriptedChat::new()).await;
    let request = EngineRequest::new("Write a scene where Mira lights the harbour lamp").with_context(
        RequestContext {
            characters: vec!["Mira".into()],
            setting: Some("Veyl harbour at dusk".into()),
            ..RequestContext::default()
        },
    );

    let response = t.engine.generate(&request, UserTier::Free).await;

    assert!(!response.is_error(), "unexpected error: {:?}", response.debug.error);
    assert_eq!(response.content, WRITER_REPLY);
    for stage in STAGES {
        assert!(
            response.debug.timings_ms.contains_key(stage),
            "missing timing for {stage}"
        );
    }
    assert!(response.debug.memory_ids.iter().any(|id| id == "mira"));
    assert_eq!(response.debug.model.as_deref(), Some("gpt-4o-mini"));
    assert!(response.debug.finished_at.is_some());

    let plan = response.debug.plan.expect("plan recorded");
    assert!(!plan.fallback);
    assert_eq!(plan.directives["structure"], json!("arrival, tension, release"));

    let writer_prompt = t.chat.prompt_for(WRITER_SYSTEM).expect("writer called");
    assert!(writer_prompt.contains("lighthouse keeper Mira"));
    assert!(writer_prompt.contains("Veyl harbour at dusk"));
    assert!(writer_prompt.contains("arrival, tension, release"));
    assert!(t.chat.prompt_for(CONSISTENCY_SYSTEM).is_some());

    let usage = t.usage.snapshot();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].success);
    assert!(!usage[0].streamed);
    assert_eq!(usage[0].request_id, response.debug.request_id);
}

#[tokio::test]
async fn empty_query_is_rejected_without_external_calls() {
    let t = test_engine(ScriptedChat::new()).await;
    let embeds_after_seeding = t
        .embedding
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);

    let response = t.engine.generate(&EngineRequest::new(""), UserTier::Vip).await;

    assert!(response.is_error());
    assert!(response.content.starts_with(ERROR_MARKER));
    let error = response.debug.error.expect("error info");
    assert_eq!(error.kind, "validation_error");
    assert_eq!(error.stage, Some(Stage::Validate));
    assert_eq!(t.chat.call_count(), 0);
    assert_eq!(
        t.embedding.calls.load(std::sync::atomic::Ordering::SeqCst),
        embeds_after_seeding
    );

    let usage = t.usage.snapshot();
    assert_eq!(usage.len(), 1);
    assert!(!usage[0].success);
}

#[tokio::test]
async fn query_one_past_the_limit_is_rejected() {
    let t = test_engine(ScriptedChat::new()).await;
    let max = t.engine.settings().max_query_length;

    let at_limit = t
        .engine
        .generate(&EngineRequest::new("a".repeat(max)), UserTier::Free)
        .await;
    assert!(!at_limit.is_error());

    let over = t
        .engine
        .generate(&EngineRequest::new("a".repeat(max + 1)), UserTier::Free)
        .await;
    let error = over.debug.error.expect("error info");
    assert_eq!(error.kind, "validation_error");
    assert!(error.message.contains(&(max + 1).to_string()));
}

#[tokio::test]
async fn writer_panic_becomes_an_error_response() {
    let t = test_engine(ScriptedChat::new().panicking_writer()).await;

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Regular)
        .await;

    assert!(response.content.starts_with(ERROR_MARKER));
    let error = response.debug.error.expect("error info");
    assert_eq!(error.kind, "pipeline_error");
    assert_eq!(error.stage, Some(Stage::Write));
    assert!(error.message.contains("writer exploded"));

    let after = t
        .engine
        .generate(&EngineRequest::new("   "), UserTier::Regular)
        .await;
    assert_eq!(after.debug.error.unwrap().kind, "validation_error");
}

#[tokio::test]
async fn writer_failure_is_reported_against_the_write_stage() {
    let t = test_engine(ScriptedChat::new().with_writer(Err(anyhow::anyhow!("rate limited")))).await;

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;

    let error = response.debug.error.expect("error info");
    assert_eq!(error.kind, "external_service_error");
    assert_eq!(error.stage, Some(Stage::Write));
    assert!(error.message.contains("rate limited"));
    assert!(t.chat.prompt_for(CONSISTENCY_SYSTEM).is_none());
}

#[tokio::test]
async fn blank_writer_reply_is_an_error() {
    let t = test_engine(ScriptedChat::new().with_writer(Ok("   ".into()))).await;

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;

    assert_eq!(
        response.debug.error.map(|e| e.stage),
        Some(Some(Stage::Write))
    );
}

#[tokio::test]
async fn understanding_failure_stops_before_retrieval() {
    let t = test_engine(
        ScriptedChat::new().with_understanding(Err(anyhow::anyhow!("connection reset"))),
    )
    .await;

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;

    let error = response.debug.error.expect("error info");
    assert_eq!(error.kind, "external_service_error");
    assert_eq!(error.stage, Some(Stage::Understand));
    assert!(response.debug.memory_ids.is_empty());
    assert!(t.chat.prompt_for(WRITER_SYSTEM).is_none());
}

#[tokio::test]
async fn non_json_understanding_falls_back_to_the_raw_query() {
    let t = test_engine(ScriptedChat::new().with_understanding(Ok("sure, happy to help".into()))).await;

    let response = t
        .engine
        .generate(&EngineRequest::new("the silver ring lost in the storm"), UserTier::Free)
        .await;

    assert!(!response.is_error());
    assert!(response.debug.memory_ids.iter().any(|id| id == "ring"));
}

#[tokio::test]
async fn director_failure_uses_fallback_plan() {
    let t = test_engine(ScriptedChat::new().with_plan(Err(anyhow::anyhow!("director down")))).await;
    let request = EngineRequest::new("Mira at the harbour").with_option("must_include", json!(["lantern"]));

    let response = t.engine.generate(&request, UserTier::Free).await;

    assert!(!response.is_error());
    let plan = response.debug.plan.expect("plan recorded");
    assert!(plan.fallback);
    assert!(t.chat.prompt_for(DIRECTOR_SYSTEM).is_some());
    assert!(
        t.chat
            .prompt_for(WRITER_SYSTEM)
            .is_some_and(|p| p.contains("lantern"))
    );
}

#[tokio::test]
async fn rule_and_memory_violations_are_reported_without_changing_content() {
    let reply = "Mira stared out with blue eyes over the harbour.";
    let t = test_engine(ScriptedChat::new().with_writer(Ok(reply.into()))).await;
    let request = EngineRequest::new("Mira watches the harbour")
        .with_option("must_include", json!(["lantern"]))
        .with_option("must_avoid", json!(["blue eyes"]));

    let response = t.engine.generate(&request, UserTier::Vip).await;

    assert_eq!(response.content, reply);
    let issues = &response.debug.consistency_issues;
    assert!(issues.iter().any(|i| i.kind == IssueKind::Rule
        && i.severity == Severity::Medium
        && i.description.contains("lantern")));
    assert!(issues.iter().any(|i| i.kind == IssueKind::Rule && i.severity == Severity::High));
    assert!(issues.iter().any(|i| i.kind == IssueKind::Character
        && i.related_memory_id.as_deref() == Some("mira")));
}

#[tokio::test]
async fn semantic_issues_are_appended_after_rule_issues() {
    let t = test_engine(ScriptedChat::new().with_consistency(Ok(
        r#"{"issues": [{"type": "event", "severity": "low", "description": "storm happens twice", "related_memory_id": "ring"}]}"#.into(),
    )))
    .await;
    let request = EngineRequest::new("Mira at the harbour").with_option("must_include", json!(["lantern"]));

    let response = t.engine.generate(&request, UserTier::Free).await;

    let issues = &response.debug.consistency_issues;
    assert_eq!(issues.len(), 2);
    assert_eq!(issues[0].kind, IssueKind::Rule);
    assert_eq!(issues[1].kind, IssueKind::Event);
    assert_eq!(issues[1].related_memory_id.as_deref(), Some("ring"));
}

#[tokio::test]
async fn consistency_outage_leaves_the_response_intact() {
    let t = test_engine(ScriptedChat::new().with_consistency(Err(anyhow::anyhow!("timeout")))).await;

    let response = t
        .engine
        .generate(&EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .await;

    assert!(!response.is_error());
    assert_eq!(response.content, WRITER_REPLY);
    assert!(response.debug.consistency_issues.is_empty());
}
