use futures_util::{StreamExt, pin_mut};
use std::sync::atomic::Ordering;

use storyloom::types::{ERROR_MARKER, StreamChunk};
use storyloom::{EngineRequest, UserTier};

use super::engine_harness::{ScriptedChat, WRITER_REPLY, test_engine};

#[tokio::test]
async fn stream_yields_text_then_a_single_done_marker() {
    let t = test_engine(ScriptedChat::new()).await;

    let chunks: Vec<StreamChunk> = t
        .engine
        .generate_stream(EngineRequest::new("Mira at the harbour"), UserTier::Regular)
        .collect()
        .await;

    let (last, body) = chunks.split_last().expect("at least one chunk");
    assert_eq!(last, &StreamChunk::done());
    assert!(body.iter().all(|c| !c.done && c.error.is_none()));
    let text: String = body.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, WRITER_REPLY);

    let usage = t.usage.snapshot();
    assert_eq!(usage.len(), 1);
    assert!(usage[0].streamed);
    assert!(usage[0].success);
}

#[tokio::test]
async fn abandoned_stream_stops_pulling_from_the_writer() {
    let t = test_engine(ScriptedChat::new()).await;
    let produced = t.chat.streamed_chunks.clone();

    {
        let chunks = t
            .engine
            .generate_stream(EngineRequest::new("Mira at the harbour"), UserTier::Free);
        pin_mut!(chunks);
        let first = chunks.next().await.expect("first chunk");
        assert!(!first.done);
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    tokio::task::yield_now().await;
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert!(WRITER_REPLY.split_inclusive(' ').count() > 1);
    assert!(t.usage.snapshot().is_empty());
}

#[tokio::test]
async fn stream_failure_ends_with_an_error_chunk() {
    let t = test_engine(ScriptedChat::new().with_writer(Err(anyhow::anyhow!("model overloaded")))).await;

    let chunks: Vec<StreamChunk> = t
        .engine
        .generate_stream(EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .collect()
        .await;

    assert_eq!(chunks.len(), 1);
    let last = &chunks[0];
    assert!(last.done);
    let error = last.error.as_deref().expect("error message");
    assert!(error.starts_with(ERROR_MARKER));
    assert!(error.contains("model overloaded"));

    let usage = t.usage.snapshot();
    assert_eq!(usage.len(), 1);
    assert!(!usage[0].success);
}

#[tokio::test]
async fn invalid_streamed_request_fails_before_any_model_call() {
    let t = test_engine(ScriptedChat::new()).await;

    let chunks: Vec<StreamChunk> = t
        .engine
        .generate_stream(EngineRequest::new(""), UserTier::Vip)
        .collect()
        .await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].error.is_some());
    assert_eq!(t.chat.call_count(), 0);
}

#[tokio::test]
async fn panicking_stream_writer_is_contained() {
    let t = test_engine(ScriptedChat::new().panicking_writer()).await;

    let chunks: Vec<StreamChunk> = t
        .engine
        .generate_stream(EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .collect()
        .await;

    let last = chunks.last().expect("terminal chunk");
    assert!(last.done);
    assert!(last.error.as_deref().is_some_and(|e| e.contains("writer exploded")));
}

#[tokio::test]
async fn stream_without_text_is_a_failure() {
    let t = test_engine(ScriptedChat::new().with_writer(Ok(String::new()))).await;

    let chunks: Vec<StreamChunk> = t
        .engine
        .generate_stream(EngineRequest::new("Mira at the harbour"), UserTier::Free)
        .collect()
        .await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].done);
    let error = chunks[0].error.as_deref().expect("error message");
    assert!(error.starts_with(ERROR_MARKER));
    assert!(error.contains("no content"));

    let usage = t.usage.snapshot();
    assert_eq!(usage.len(), 1);
    assert!(!usage[0].success);
}
