use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use storyloom::config::{Component, ModelConfig};
use storyloom::embedding::{EmbeddingBackend, OpenAiEmbedding};
use storyloom::llm::{
    ChatBackend, ChatBackendFactory, HttpChatFactory, OpenAiCompatibleChat, ReliableChat,
};

fn completion(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]
    })
}

#[tokio::test]
async fn chat_posts_messages_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_json(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "temperature": 0.5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hi there")))
        .expect(1)
        .mount(&server)
        .await;

    let chat = OpenAiCompatibleChat::new("openai", &format!("{}/v1", server.uri()), "test-key");
    let reply = chat
        .generate_text(Some("be brief"), "hello", "gpt-4o-mini", 0.5)
        .await
        .expect("completion");

    assert_eq!(reply, "hi there");
    server.verify().await;
}

#[tokio::test]
async fn chat_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let chat = OpenAiCompatibleChat::new("openai", &format!("{}/v1", server.uri()), "bad");
    let err = chat
        .generate_text(None, "hello", "gpt-4o-mini", 0.5)
        .await
        .expect_err("401 must fail");

    let message = err.to_string();
    assert!(message.contains("401"), "{message}");
    assert!(message.contains("invalid api key"), "{message}");
}

#[tokio::test]
async fn chat_stream_decodes_server_sent_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Mira \"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"waited.\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let chat = OpenAiCompatibleChat::new("openai", &format!("{}/v1", server.uri()), "test-key");
    let chunks: Vec<String> = chat
        .generate_stream(None, "go", "gpt-4o-mini", 0.7)
        .await
        .expect("stream opens")
        .map(|c| c.expect("chunk"))
        .collect()
        .await;

    assert_eq!(chunks, vec!["Mira ".to_string(), "waited.".to_string()]);
    server.verify().await;
}

#[tokio::test]
async fn reliable_chat_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let inner = Arc::new(OpenAiCompatibleChat::new(
        "openai",
        &format!("{}/v1", server.uri()),
        "test-key",
    ));
    let chat = ReliableChat::new(inner, 2, 10);
    let reply = chat
        .generate_text(None, "hello", "gpt-4o-mini", 0.5)
        .await
        .expect("second attempt succeeds");

    assert_eq!(reply, "recovered");
    server.verify().await;
}

#[tokio::test]
async fn factory_backends_reach_the_configured_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-writer"))
        .and(body_partial_json(json!({"model": "gpt-4.1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let factory = HttpChatFactory {
        max_retries: 0,
        backoff_ms: 10,
    };
    let config = ModelConfig {
        model_id: Some("gpt-4.1".into()),
        api_key: Some("sk-writer".into()),
        base_url: Some(format!("{}/v1", server.uri())),
        temperature: None,
    };
    let backend = factory
        .create(&Component::Writer.to_string(), &config)
        .expect("backend");

    assert_eq!(backend.name(), "openai-compatible:writer");
    let reply = backend
        .generate_text(None, "ping", "gpt-4.1", 0.0)
        .await
        .expect("reply");
    assert_eq!(reply, "ok");
    server.verify().await;
}

#[tokio::test]
async fn embeddings_are_requested_in_one_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_json(json!({
            "model": "text-embedding-3-small",
            "input": ["harbour", "lighthouse"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 0, "embedding": [0.1, 0.2, 0.3]},
                {"index": 1, "embedding": [0.3, 0.2, 0.1]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embedding = OpenAiEmbedding::new(
        &format!("{}/v1", server.uri()),
        "test-key",
        "text-embedding-3-small",
        3,
    );
    let vectors = embedding
        .embed(&["harbour", "lighthouse"])
        .await
        .expect("embeddings");

    assert_eq!(vectors.len(), 2);
    assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    server.verify().await;
}

#[tokio::test]
async fn embedding_dimension_mismatch_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1, 0.2]}]
        })))
        .mount(&server)
        .await;

    let embedding = OpenAiEmbedding::new(&format!("{}/v1", server.uri()), "k", "m", 3);
    let err = embedding.embed_one("harbour").await.expect_err("mismatch");

    assert!(err.to_string().contains("dimension mismatch"));
}
