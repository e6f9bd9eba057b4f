use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use httpmock::prelude::*;
use llm_relay::client::{AsyncApiRequest, StreamItem};
use llm_relay::config::{ProviderConfig, RelayConfig};
use llm_relay::db::Database;
use llm_relay::repository::get_message_by_id;
use llm_relay::schemas::{ChatChunk, ChatRequest};
use llm_relay::server::{self, AppState};
use llm_relay::template::default_templates;
use serde_json::json;
use tempfile::TempDir;

pub struct TestApp {
    pub address: String,
    pub db: Database,
    pub provider: MockServer,
    _dir: TempDir,
}

impl TestApp {
    fn api(&self) -> AsyncApiRequest {
        AsyncApiRequest::new(self.address.clone(), Duration::from_secs(10))
    }

    fn stored_response(&self, message_id: &str) -> String {
        self.db
            .with_session(|conn| get_message_by_id(conn, message_id))
            .expect("query")
            .expect("stored message")
            .response
    }
}

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn spawn_app_with(configure: impl FnOnce(&mut RelayConfig)) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = MockServer::start_async().await;

    let templates_path = dir.path().join("prompt_templates.yaml");
    std::fs::write(
        &templates_path,
        serde_yaml::to_string(&default_templates()).unwrap(),
    )
    .unwrap();

    let mut online_llm_model = BTreeMap::new();
    online_llm_model.insert(
        "openai-api".to_string(),
        ProviderConfig {
            model_name: "gpt-3.5-turbo".to_string(),
            api_base_url: provider.url("/v1"),
            api_key: Some("test-key".to_string()),
            openai_proxy: None,
            temperature: Some(0.0),
            max_tokens: None,
        },
    );
    let mut config = RelayConfig {
        online_llm_model,
        database_url: dir.path().join("relay.db").to_string_lossy().into_owned(),
        ..RelayConfig::default()
    };
    configure(&mut config);

    let db = Database::new(config.database_url.clone());
    db.init_schema().expect("schema");
    let state = AppState::new(config, db.clone(), templates_path);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let app = server::build(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });

    TestApp {
        address: format!("http://127.0.0.1:{port}"),
        db,
        provider,
        _dir: dir,
    }
}

async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_streams_tagged_chunks_and_persists_answer() {
    let app = spawn_app().await;
    let completion = app
        .provider
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body(&["Hi", " there"]));
        })
        .await;

    let request = ChatRequest {
        conversation_id: "conv-1".to_string(),
        ..ChatRequest::new("hello")
    };
    let chunks: Vec<ChatChunk> = app
        .api()
        .chat(request)
        .filter_map(|item| async move { item.data() })
        .collect()
        .await;

    completion.assert_async().await;
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["Hi", " there"]);

    let message_id = chunks[1].message_id.clone().expect("tagged chunk");
    assert!(chunks.iter().all(|c| c.message_id.as_deref() == Some(&message_id)));
    assert_eq!(app.stored_response(&message_id), "Hi there");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_streaming_chat_returns_one_object() {
    let app = spawn_app().await;
    app.provider
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "id": "chatcmpl-2",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-3.5-turbo",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Whole answer"},
                    "finish_reason": "stop"
                }]
            }));
        })
        .await;

    let request = ChatRequest {
        stream: false,
        ..ChatRequest::new("hello")
    };
    let items: Vec<_> = app.api().chat(request).collect().await;
    assert_eq!(items.len(), 1);
    let chunk = items.into_iter().next().unwrap().data().expect("data item");
    assert_eq!(chunk.text, "Whole answer");
    assert_eq!(
        app.stored_response(chunk.message_id.as_deref().unwrap()),
        "Whole answer"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_fault_ends_stream_with_error_record() {
    let app = spawn_app().await;
    app.provider
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(400)
                .json_body(json!({"error": {"message": "bad request", "type": "invalid_request_error"}}));
        })
        .await;

    let items: Vec<_> = app.api().chat(ChatRequest::new("hello")).collect().await;
    let last = items.last().expect("at least one item");
    match last {
        StreamItem::Error(err) => assert_eq!(err.code, 500),
        other => panic!("expected error record, got {other:?}"),
    }
    assert_eq!(items.iter().filter(|i| i.is_error()).count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_prompt_template_is_not_found() {
    let app = spawn_app().await;
    let request = ChatRequest {
        prompt_name: "missing".to_string(),
        ..ChatRequest::new("hello")
    };
    let items: Vec<_> = app.api().chat(request).collect().await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        StreamItem::Error(err) => {
            assert_eq!(err.code, 404);
            assert!(err.msg.contains("missing"));
        }
        other => panic!("expected error record, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unconfigured_model_is_a_server_error() {
    let app = spawn_app_with(|config| {
        config.online_llm_model.clear();
    })
    .await;
    let items: Vec<_> = app.api().chat(ChatRequest::new("hello")).collect().await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        StreamItem::Error(err) => assert_eq!(err.code, 500),
        other => panic!("expected error record, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn demo_message_endpoint_returns_envelope() {
    let app = spawn_app().await;
    let value = app.api().add_message_demo().await;
    assert_eq!(value["code"], 200);
    assert_eq!(value["msg"], "success");
    let message_id = value["data"]["message_id"].as_str().unwrap();
    assert_eq!(message_id.len(), 32);
    assert_eq!(app.stored_response(message_id), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn feedback_updates_known_messages_only() {
    let app = spawn_app().await;
    let api = app.api();
    let created = api.add_message_demo().await;
    let message_id = created["data"]["message_id"].as_str().unwrap().to_string();

    let ok = api.chat_feedback(&message_id, 90, "great").await;
    assert_eq!(ok["code"], 200);
    let stored = app
        .db
        .with_session(|conn| get_message_by_id(conn, &message_id))
        .unwrap()
        .unwrap();
    assert_eq!(stored.feedback_score, 90);
    assert_eq!(stored.feedback_reason, "great");

    let missing = api.chat_feedback("no-such-id", 1, "").await;
    assert_eq!(missing["code"], 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn root_redirects_to_docs() {
    let app = spawn_app().await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = client.get(&app.address).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/docs");

    let openapi = reqwest::get(format!("{}/openapi.json", app.address))
        .await
        .unwrap();
    assert!(openapi.status().is_success());
}
