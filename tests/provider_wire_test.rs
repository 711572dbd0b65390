//! Wire-level adapter tests against mocked provider APIs.

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quill_ai::models::{create_adapter, GenerationRequest, Message, ProviderConfig, StreamChunk};
use quill_ai::{AdapterResult, ErrorKind};

fn openai_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig::new("openai", "test-api-key").with_base_url(server.uri())
}

fn sse_body(frames: &[&str]) -> String {
    frames.iter().map(|frame| format!("data: {}\n\n", frame)).collect()
}

#[tokio::test]
async fn test_openai_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-api-key"))
        .and(body_partial_json(json!({"model": "gpt-4", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-123",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello! How can I help?"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = create_adapter(&openai_config(&server)).unwrap();
    let response = adapter
        .generate_text(&GenerationRequest::new("gpt-4").with_prompt("Hello"))
        .await
        .unwrap();

    assert_eq!(response.id, "chatcmpl-123");
    assert_eq!(response.text, "Hello! How can I help?");
    assert_eq!(response.usage.total_tokens, 21);
    assert_eq!(response.finish_reason, "stop");
}

#[tokio::test]
async fn test_openai_error_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "You exceeded your current quota", "type": "insufficient_quota", "code": "insufficient_quota"}
        })))
        .mount(&server)
        .await;

    let adapter = create_adapter(&openai_config(&server)).unwrap();
    let err = adapter
        .generate_text(&GenerationRequest::new("gpt-4").with_prompt("Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert!(!err.retryable);
    assert_eq!(err.status, Some(429));
    assert_eq!(err.code, "insufficient_quota");
}

#[tokio::test]
async fn test_openai_plain_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let adapter = create_adapter(&openai_config(&server)).unwrap();
    let err = adapter
        .generate_text(&GenerationRequest::new("gpt-4").with_prompt("Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    assert!(err.should_retry());
}

#[tokio::test]
async fn test_openai_stream() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#,
        r#"{"choices":[{"delta":{"content":"Once "},"finish_reason":null}]}"#,
        r#"{"choices":[{"delta":{"content":"upon a time"},"finish_reason":null}]}"#,
        r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":4,"total_tokens":9}}"#,
        "[DONE]",
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let adapter = create_adapter(&openai_config(&server)).unwrap();
    let mut rx = adapter
        .generate_text_stream(
            &GenerationRequest::new("gpt-4").with_prompt("Tell a story").with_streaming(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(item) = rx.recv().await {
        chunks.push(item.unwrap());
    }

    let deltas: String = chunks.iter().map(|c| c.delta.as_str()).collect();
    let last = chunks.last().unwrap();
    assert_eq!(deltas, "Once upon a time");
    assert!(last.is_complete);
    assert_eq!(last.content, "Once upon a time");
    assert_eq!(last.finish_reason.as_deref(), Some("stop"));
    assert_eq!(last.usage.map(|u| u.total_tokens), Some(9));
    assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
}

#[tokio::test]
async fn test_openai_stream_handshake_failure_is_synchronous() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let adapter = create_adapter(&openai_config(&server)).unwrap();
    let err = adapter
        .generate_text_stream(
            &GenerationRequest::new("gpt-4").with_prompt("hi").with_streaming(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert!(err.retryable);
}

#[tokio::test]
async fn test_anthropic_completion_with_system_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"system": "You are terse."})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "Hi."}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = create_adapter(&ProviderConfig::new("anthropic", "test-key").with_base_url(server.uri())).unwrap();
    let request = GenerationRequest::new("claude-3-5-haiku-20241022")
        .with_messages(vec![Message::system("You are terse."), Message::user("Hello")]);
    let response = adapter.generate_text(&request).await.unwrap();

    assert_eq!(response.text, "Hi.");
    assert_eq!(response.usage.total_tokens, 12);
    assert_eq!(response.finish_reason, "end_turn");
}

#[tokio::test]
async fn test_anthropic_stream() {
    let server = MockServer::start().await;
    let body = [
        ("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":8,"output_tokens":1}}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#),
        ("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#),
        ("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#),
        ("message_stop", r#"{"type":"message_stop"}"#),
    ]
    .iter()
    .map(|(event, data)| format!("event: {}\ndata: {}\n\n", event, data))
    .collect::<String>();

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let adapter = create_adapter(&ProviderConfig::new("anthropic", "test-key").with_base_url(server.uri())).unwrap();
    let mut rx = adapter
        .generate_text_stream(
            &GenerationRequest::new("claude-3-5-haiku-20241022").with_prompt("hi").with_streaming(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut last = None;
    while let Some(item) = rx.recv().await {
        last = Some(item.unwrap());
    }
    let last = last.unwrap();
    assert!(last.is_complete);
    assert_eq!(last.content, "Hello there");
}

#[tokio::test]
async fn test_gemini_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
        .and(query_param("key", "test-key"))
        .and(body_partial_json(json!({"systemInstruction": {"parts": [{"text": "Be brief."}]}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Sure"}, {"text": " thing."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 3, "totalTokenCount": 9}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = create_adapter(&ProviderConfig::new("gemini", "test-key").with_base_url(server.uri())).unwrap();
    let request = GenerationRequest::new("gemini-1.5-flash")
        .with_messages(vec![Message::system("Be brief."), Message::user("Hello")]);
    let response = adapter.generate_text(&request).await.unwrap();

    assert_eq!(response.text, "Sure thing.");
    assert_eq!(response.usage.total_tokens, 9);
}

#[tokio::test]
async fn test_gemini_blocked_prompt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        })))
        .mount(&server)
        .await;

    let adapter = create_adapter(&ProviderConfig::new("gemini", "test-key").with_base_url(server.uri())).unwrap();
    let err = adapter
        .generate_text(&GenerationRequest::new("gemini-1.5-flash").with_prompt("..."))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert_eq!(err.code, "PROMPT_BLOCKED");
}

async fn gemini_stream(server: &MockServer, frames: &[&str]) -> Vec<AdapterResult<StreamChunk>> {
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-flash:streamGenerateContent"))
        .and(query_param("key", "test-key"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(frames), "text/event-stream"))
        .expect(1)
        .mount(server)
        .await;

    let adapter = create_adapter(&ProviderConfig::new("gemini", "test-key").with_base_url(server.uri())).unwrap();
    let mut rx = adapter
        .generate_text_stream(
            &GenerationRequest::new("gemini-1.5-flash").with_prompt("Tell a story").with_streaming(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}

#[tokio::test]
async fn test_gemini_stream() {
    let server = MockServer::start().await;
    let items = gemini_stream(
        &server,
        &[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Once "}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"upon a time"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":5}}"#,
        ],
    )
    .await;

    let chunks: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
    let deltas: String = chunks.iter().map(|c| c.delta.as_str()).collect();
    let last = chunks.last().unwrap();
    assert_eq!(deltas, "Once upon a time");
    assert!(last.is_complete);
    assert_eq!(last.content, "Once upon a time");
    assert_eq!(last.finish_reason.as_deref(), Some("STOP"));
    assert_eq!(last.usage.map(|u| u.total_tokens), Some(9));
    assert_eq!(chunks.iter().filter(|c| c.is_complete).count(), 1);
}

#[tokio::test]
async fn test_gemini_stream_without_finish_reason_is_truncated() {
    let server = MockServer::start().await;
    let items = gemini_stream(
        &server,
        &[r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Once "}]}}]}"#],
    )
    .await;

    assert_eq!(items.first().unwrap().as_ref().unwrap().delta, "Once ");
    let err = items.last().unwrap().as_ref().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidResponse);
    assert_eq!(err.code, "STREAM_TRUNCATED");
    assert!(items.iter().all(|item| item.as_ref().map_or(true, |c| !c.is_complete)));
}

#[tokio::test]
async fn test_gemini_stream_blocked_mid_stream() {
    let server = MockServer::start().await;
    let items = gemini_stream(
        &server,
        &[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Once "}]}}]}"#,
            r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"never sent"}]},"finishReason":"STOP"}]}"#,
        ],
    )
    .await;

    assert_eq!(items.len(), 2);
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert_eq!(err.code, "PROMPT_BLOCKED");
}

fn wenxin_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig::new("wenxin", "client-id")
        .with_secret_key("client-secret")
        .with_base_url(server.uri())
}

async fn mount_token(server: &MockServer, token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/2.0/token"))
        .and(query_param("grant_type", "client_credentials"))
        .and(query_param("client_id", "client-id"))
        .and(query_param("client_secret", "client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": 2592000
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_wenxin_token_exchange_then_call() {
    let server = MockServer::start().await;
    mount_token(&server, "token-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions_pro"))
        .and(query_param("access_token", "token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "as-1",
            "result": "你好",
            "is_end": true,
            "is_truncated": false,
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })))
        .expect(2)
        .mount(&server)
        .await;

    let adapter = create_adapter(&wenxin_config(&server)).unwrap();
    let request = GenerationRequest::new("ernie-4.0-8k").with_prompt("hello");

    let first = adapter.generate_text(&request).await.unwrap();
    let second = adapter.generate_text(&request).await.unwrap();

    assert_eq!(first.text, "你好");
    assert_eq!(first.finish_reason, "stop");
    assert_eq!(second.usage.total_tokens, 5);
}

#[tokio::test]
async fn test_wenxin_body_error_on_http_200() {
    let server = MockServer::start().await;
    mount_token(&server, "token-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error_code": 18,
            "error_msg": "Open api qps request limit reached"
        })))
        .mount(&server)
        .await;

    let adapter = create_adapter(&wenxin_config(&server)).unwrap();
    let err = adapter
        .generate_text(&GenerationRequest::new("ernie-3.5-8k").with_prompt("hello"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert!(err.retryable);
    assert_eq!(err.code, "WENXIN_18");
}

#[tokio::test]
async fn test_wenxin_refreshes_rejected_token() {
    let server = MockServer::start().await;
    mount_token(&server, "token-1", 2).await;
    Mock::given(method("POST"))
        .and(path("/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error_code": 111,
            "error_msg": "Access token expired"
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "as-2",
            "result": "ok",
            "is_end": true
        })))
        .mount(&server)
        .await;

    let adapter = create_adapter(&wenxin_config(&server)).unwrap();
    let response = adapter
        .generate_text(&GenerationRequest::new("ernie-3.5-8k").with_prompt("hello"))
        .await
        .unwrap();
    assert_eq!(response.text, "ok");
}
