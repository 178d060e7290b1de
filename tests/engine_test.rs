use colloquy::dispatch::{NoTools, ProjectReader, ToolCallDispatcher};
use colloquy::engine::{ChatEngine, EngineConfig, PanelEvent};
use colloquy::generation_info::GenerationInfoFetcher;
use colloquy::hardening::{is_not_found, RetryPolicy};
use colloquy::projections::Endpoints;
use colloquy::session::{MemorySessionStore, SessionStore};
use colloquy::tool_schema::ChatMode;
use colloquy::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPENROUTER_MODEL: &str = "openai/gpt-4o";
const GOOGLE_MODEL: &str = "gemini-2.5-flash";

fn scope() -> SessionScope {
    SessionScope::new("/work/app", "default")
}

fn config(server: &MockServer, model: &str) -> EngineConfig {
    config_at(&server.uri(), model)
}

fn config_at(base: &str, model: &str) -> EngineConfig {
    let mut config = EngineConfig::new(model, scope());
    config.openrouter_api_key = Some("sk-or-test".to_string());
    config.google_api_key = Some("g-test".to_string());
    config.endpoints = Endpoints {
        openrouter: base.to_string(),
        google: base.to_string(),
    };
    config
}

fn engine(
    server: &MockServer,
    config: EngineConfig,
    store: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn ToolCallDispatcher>,
) -> ChatEngine {
    engine_at(&server.uri(), config, store, dispatcher)
}

fn engine_at(
    base: &str,
    config: EngineConfig,
    store: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn ToolCallDispatcher>,
) -> ChatEngine {
    let client = reqwest::Client::new();
    let fetcher = GenerationInfoFetcher::new(client.clone(), base)
        .with_policy(RetryPolicy::fixed(3, Duration::from_millis(10)).retry_on(is_not_found));
    ChatEngine::new(config, client, store, dispatcher).with_fetcher(fetcher)
}

fn sse(frames: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn contents(engine: &ChatEngine) -> Vec<(Role, Option<String>)> {
    engine
        .snapshot()
        .iter()
        .map(|m| (m.role, m.content.clone()))
        .collect()
}

#[tokio::test]
async fn test_openrouter_stream_with_generation_info() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-or-test"))
        .and(body_partial_json(serde_json::json!({
            "model": OPENROUTER_MODEL,
            "stream": true,
            "messages": [{"role": "user", "content": "Hi"}]
        })))
        .respond_with(sse(&[
            r#"{"id":"gen-a","choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"id":"gen-a","choices":[{"delta":{"content":"lo"}}]}"#,
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/generation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"tokens_prompt": 8, "tokens_completion": 2, "total_cost": 0.001}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let engine = engine(&server, config(&server, OPENROUTER_MODEL), store.clone(), Arc::new(NoTools));
    let mut events = engine.subscribe();

    if let Err(e) = engine.send_chat_message("Hi", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    assert_eq!(
        contents(&engine),
        vec![
            (Role::User, Some("Hi".to_string())),
            (Role::Assistant, Some("Hello".to_string())),
        ]
    );
    let snapshot = engine.snapshot();
    assert_eq!(snapshot[1].generation_info.map(|g| g.total_tokens()), Some(10));
    assert!(!engine.is_loading());

    let header = match engine.active_session() {
        Some(h) => h,
        None => panic!("a session should have been created"),
    };
    assert_eq!(header.title, "Hi");
    let saved = match store.load(&scope(), &header.id).await {
        Ok(s) => s,
        Err(e) => panic!("load failed: {:?}", e),
    };
    assert_eq!(saved.messages.len(), 2);
    assert_eq!(saved.total_tokens, Some(10));
    assert_eq!(saved.total_cost, Some(0.001));

    let mut saw_loading_off = false;
    while let Ok(event) = events.try_recv() {
        if event == PanelEvent::LoadingChanged(false) {
            saw_loading_off = true;
        }
    }
    assert!(saw_loading_off);
}

#[tokio::test]
async fn test_http_error_becomes_error_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "No auth credentials found", "code": 401}
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let engine = engine(&server, config(&server, OPENROUTER_MODEL), store.clone(), Arc::new(NoTools));
    if let Err(e) = engine.send_chat_message("Hi", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot[1].content.as_deref(),
        Some("**Error**\n\nNo auth credentials found")
    );
    assert!(!engine.is_loading());

    // The error turn is persisted like any other.
    let id = engine.active_session().map(|h| h.id).unwrap_or_default();
    let saved = store.load(&scope(), &id).await.map(|s| s.messages.len()).ok();
    assert_eq!(saved, Some(2));
}

#[tokio::test]
async fn test_missing_api_key_is_reported_in_transcript() {
    let server = MockServer::start().await;
    let mut config = config(&server, OPENROUTER_MODEL);
    config.openrouter_api_key = None;
    config.error_header = "Oops".to_string();

    let engine = engine(&server, config, Arc::new(MemorySessionStore::new()), Arc::new(NoTools));
    if let Err(e) = engine.send_chat_message("Hi", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    let last = engine.snapshot().last().cloned();
    let content = last.and_then(|m| m.content).unwrap_or_default();
    assert!(content.starts_with("Oops\n\n"), "got {}", content);
    assert!(content.contains("openrouter"));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_google_stream_tool_round_trip() {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir: {}", e),
    };
    if let Err(e) = std::fs::write(dir.path().join("notes.txt"), "remember the milk") {
        panic!("write: {}", e);
    }

    let server = MockServer::start().await;
    let stream_path = format!("/models/{}:streamGenerateContent", GOOGLE_MODEL);
    Mock::given(method("POST"))
        .and(path(stream_path.as_str()))
        .and(header("x-goog-api-key", "g-test"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"[{"candidates":[{"content":{"parts":[{"text":"Let me look.","thought":true},{"functionCall":{"name":"read_file","args":{"file_path":"notes.txt"}}}]}}]}]"#,
            "application/json",
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(stream_path.as_str()))
        .and(body_string_contains("[TOOL_RESULT for read_file]"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                r#"[{"candidates":[{"content":{"parts":[{"text":"It says "}]}}]}"#,
                "\n,",
                r#"{"candidates":[{"content":{"parts":[{"text":"to buy milk."}]}}],"usageMetadata":{"promptTokenCount":40,"candidatesTokenCount":6,"totalTokenCount":46}}]"#,
            ),
            "application/json",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(&server, GOOGLE_MODEL);
    config.mode = ChatMode::Context;
    let engine = engine(
        &server,
        config,
        Arc::new(MemorySessionStore::new()),
        Arc::new(ProjectReader::new(dir.path())),
    );

    if let Err(e) = engine.send_chat_message("What is in my notes?", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 5, "transcript: {:?}", snapshot);

    // The thought streamed ahead of the call keeps its own assistant turn.
    assert_eq!(snapshot[1].reasoning.as_deref(), Some("Let me look."));
    assert!(!snapshot[1].has_tool_calls());

    let call_msg = &snapshot[2];
    let calls = call_msg.tool_calls.clone().unwrap_or_default();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "read_file");
    assert_eq!(calls[0].function.arguments, r#"{"file_path":"notes.txt"}"#);
    assert_eq!(calls[0].status, Some(ToolCallStatus::Success));

    let result = &snapshot[3];
    assert!(result.hidden);
    assert_eq!(
        result.content.as_deref(),
        Some("[TOOL_RESULT for read_file]\nHere is the content of notes.txt:\n\nremember the milk")
    );

    let answer = &snapshot[4];
    assert_eq!(answer.content.as_deref(), Some("It says to buy milk."));
    assert_eq!(answer.generation_info.map(|g| g.tokens_prompt), Some(40));
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_google_blocked_single_shot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/models/{}:generateContent", GOOGLE_MODEL).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(&server, GOOGLE_MODEL);
    config.stream = false;
    let engine = engine(&server, config, Arc::new(MemorySessionStore::new()), Arc::new(NoTools));
    if let Err(e) = engine.send_chat_message("something", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    let last = engine.snapshot().last().cloned();
    assert_eq!(
        last.and_then(|m| m.content).as_deref(),
        Some("The response was blocked by the provider. Reason: SAFETY")
    );
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_second_send_supersedes_pending_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse(&[r#"{"choices":[{"delta":{"content":"stale answer"}}]}"#])
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(&[r#"{"choices":[{"delta":{"content":"fresh answer"}}]}"#]))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let engine = Arc::new(engine(
        &server,
        config(&server, OPENROUTER_MODEL),
        store.clone(),
        Arc::new(NoTools),
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("one", Vec::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.is_loading());

    if let Err(e) = engine.send_chat_message("two", Vec::new(), None).await {
        panic!("second send failed: {:?}", e);
    }
    match tokio::time::timeout(Duration::from_secs(2), first).await {
        Ok(Ok(Ok(()))) => {}
        other => panic!("first send did not wind down cleanly: {:?}", other.map(|r| r.is_ok())),
    }

    assert_eq!(
        contents(&engine),
        vec![
            (Role::User, Some("one".to_string())),
            (Role::User, Some("two".to_string())),
            (Role::Assistant, Some("fresh answer".to_string())),
        ]
    );
    assert!(!engine.is_loading());

    let id = engine.active_session().map(|h| h.id).unwrap_or_default();
    let saved = store.load(&scope(), &id).await.map(|s| s.messages.len()).ok();
    assert_eq!(saved, Some(3));
}

#[tokio::test]
async fn test_stop_response_discards_late_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse(&[r#"{"choices":[{"delta":{"content":"too late"}}]}"#]).set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let engine = Arc::new(engine(
        &server,
        config(&server, OPENROUTER_MODEL),
        Arc::new(MemorySessionStore::new()),
        Arc::new(NoTools),
    ));
    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("wait", Vec::new(), None).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    if let Err(e) = engine.stop_response().await {
        panic!("stop failed: {:?}", e);
    }
    assert!(!engine.is_loading());
    assert!(tokio::time::timeout(Duration::from_secs(2), pending).await.is_ok());

    assert_eq!(contents(&engine), vec![(Role::User, Some("wait".to_string()))]);
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_tool_rounds_are_capped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": null, "tool_calls": [{
                "id": "call_loop",
                "type": "function",
                "function": {"name": "get_project_file_tree", "arguments": "{}"}
            }]}}]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = config(&server, OPENROUTER_MODEL);
    config.stream = false;
    config.mode = ChatMode::Agent;
    config.max_tool_rounds = 1;
    let engine = engine(&server, config, Arc::new(MemorySessionStore::new()), Arc::new(NoTools));
    if let Err(e) = engine.send_chat_message("loop forever", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 4, "transcript: {:?}", snapshot);
    assert!(snapshot[1].has_tool_calls());
    let first_status = snapshot[1].tool_calls.as_ref().and_then(|c| c[0].status);
    assert_eq!(first_status, Some(ToolCallStatus::Error));
    assert!(snapshot[2].hidden);
    assert!(snapshot[3].has_tool_calls());
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_regenerate_and_edit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("edited question"))
        .respond_with(sse(&[r#"{"choices":[{"delta":{"content":"edited answer"}}]}"#]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(&[r#"{"choices":[{"delta":{"content":"answer"}}]}"#]))
        .expect(2)
        .mount(&server)
        .await;

    let engine = engine(
        &server,
        config(&server, OPENROUTER_MODEL),
        Arc::new(MemorySessionStore::new()),
        Arc::new(NoTools),
    );
    let attachment = AttachedItem {
        id: "src/lib.rs".to_string(),
        name: "lib.rs".to_string(),
        kind: AttachedItemKind::File,
    };

    if let Err(e) = engine
        .send_chat_message("question", vec![attachment.clone()], None)
        .await
    {
        panic!("send failed: {:?}", e);
    }
    let len = engine.snapshot().len();
    if let Err(e) = engine.regenerate_response(len).await {
        panic!("regenerate failed: {:?}", e);
    }
    assert_eq!(
        contents(&engine),
        vec![
            (Role::User, Some("question".to_string())),
            (Role::Assistant, Some("answer".to_string())),
        ]
    );

    if let Err(e) = engine.edit_and_resubmit("edited question", 0).await {
        panic!("edit failed: {:?}", e);
    }
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].content.as_deref(), Some("edited question"));
    assert_eq!(snapshot[0].attached_files, Some(vec![attachment]));
    assert_eq!(snapshot[1].content.as_deref(), Some("edited answer"));
}

#[tokio::test]
async fn test_regenerate_without_session_fails() {
    let server = MockServer::start().await;
    let engine = engine(
        &server,
        config(&server, OPENROUTER_MODEL),
        Arc::new(MemorySessionStore::new()),
        Arc::new(NoTools),
    );
    let err = engine.regenerate_response(0).await.err().map(|e| e.inner);
    assert!(matches!(err, Some(ColloquyError::NoActiveSession)));
}

#[tokio::test]
async fn test_session_switching() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(&[r#"{"choices":[{"delta":{"content":"ok"}}]}"#]))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let engine = engine(&server, config(&server, OPENROUTER_MODEL), store.clone(), Arc::new(NoTools));

    if let Err(e) = engine.send_chat_message("first topic", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }
    let first_id = engine.active_session().map(|h| h.id).unwrap_or_default();

    if let Err(e) = engine.new_session().await {
        panic!("new_session failed: {:?}", e);
    }
    assert!(engine.active_session().is_none());
    assert!(engine.snapshot().is_empty());

    if let Err(e) = engine.send_chat_message("second topic", Vec::new(), None).await {
        panic!("send failed: {:?}", e);
    }
    let second_id = engine.active_session().map(|h| h.id).unwrap_or_default();
    assert_ne!(first_id, second_id);

    let listed = engine.list_sessions().await.map(|l| l.len()).ok();
    assert_eq!(listed, Some(2));

    if let Err(e) = engine.load_session(&first_id).await {
        panic!("load failed: {:?}", e);
    }
    assert_eq!(
        engine.snapshot().first().and_then(|m| m.content.clone()).as_deref(),
        Some("first topic")
    );

    if let Err(e) = engine.rename_session(&first_id, "Renamed").await {
        panic!("rename failed: {:?}", e);
    }
    assert_eq!(engine.active_session().map(|h| h.title).as_deref(), Some("Renamed"));

    if let Err(e) = engine.delete_session(&first_id).await {
        panic!("delete failed: {:?}", e);
    }
    assert!(engine.active_session().is_none());
    assert!(engine.snapshot().is_empty());
    assert_eq!(engine.list_sessions().await.map(|l| l.len()).ok(), Some(1));

    if let Err(e) = engine.delete_all_sessions().await {
        panic!("delete_all failed: {:?}", e);
    }
    assert_eq!(engine.list_sessions().await.map(|l| l.len()).ok(), Some(0));
    assert!(engine.load_session(&second_id).await.is_err());
}

/// One scripted reply per accepted connection. A stalled reply flushes its
/// frames and then keeps the connection open without finishing the body.
struct ScriptedReply {
    frames: Vec<&'static str>,
    stall: bool,
}

fn streamed(frames: &[&'static str]) -> ScriptedReply {
    ScriptedReply {
        frames: frames.to_vec(),
        stall: false,
    }
}

fn stalled(frames: &[&'static str]) -> ScriptedReply {
    ScriptedReply {
        frames: frames.to_vec(),
        stall: true,
    }
}

async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return;
        }
    }
}

async fn chunked_sse_server(replies: Vec<ScriptedReply>) -> String {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("bind: {}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("local_addr: {}", e),
    };
    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                            transfer-encoding: chunked\r\nconnection: close\r\n\r\n";
                let _ = socket.write_all(head.as_bytes()).await;
                let mut frames: Vec<String> =
                    reply.frames.iter().map(|f| format!("data: {}\n\n", f)).collect();
                if !reply.stall {
                    frames.push("data: [DONE]\n\n".to_string());
                }
                for frame in frames {
                    let chunk = format!("{:x}\r\n{}\r\n", frame.len(), frame);
                    let _ = socket.write_all(chunk.as_bytes()).await;
                }
                let _ = socket.flush().await;
                if reply.stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                } else {
                    let _ = socket.write_all(b"0\r\n\r\n").await;
                }
            });
        }
    });
    format!("http://{}", addr)
}

async fn wait_for_last_content(engine: &ChatEngine, expected: &str) {
    for _ in 0..500 {
        if engine.snapshot().last().and_then(|m| m.content.as_deref()) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("last message never became {:?}: {:?}", expected, contents(engine));
}

const PARTIAL_FRAME: &str = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
const FRESH_FRAME: &str = r#"{"choices":[{"delta":{"content":"fresh"}}]}"#;

/// Delays saves of sessions that already hold an assistant reply.
struct SlowSaveStore {
    inner: MemorySessionStore,
    slow: AtomicBool,
    delay: Duration,
    save_started: Notify,
}

impl SlowSaveStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemorySessionStore::new(),
            slow: AtomicBool::new(false),
            delay,
            save_started: Notify::new(),
        }
    }
}

#[async_trait]
impl SessionStore for SlowSaveStore {
    async fn create(&self, scope: &SessionScope, title: &str) -> Result<Session> {
        self.inner.create(scope, title).await
    }

    async fn save(&self, scope: &SessionScope, session: &Session) -> Result<()> {
        let answered = session.messages.iter().any(|m| m.role == Role::Assistant);
        if answered && self.slow.load(Ordering::SeqCst) {
            self.save_started.notify_one();
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save(scope, session).await
    }

    async fn list(&self, scope: &SessionScope) -> Result<Vec<SessionHeader>> {
        self.inner.list(scope).await
    }

    async fn load(&self, scope: &SessionScope, id: &str) -> Result<Session> {
        self.inner.load(scope, id).await
    }

    async fn delete(&self, scope: &SessionScope, id: &str) -> Result<()> {
        self.inner.delete(scope, id).await
    }

    async fn rename(&self, scope: &SessionScope, id: &str, title: &str) -> Result<()> {
        self.inner.rename(scope, id, title).await
    }

    async fn delete_all(&self, scope: &SessionScope) -> Result<()> {
        self.inner.delete_all(scope).await
    }
}

#[tokio::test]
async fn test_stop_mid_stream_keeps_partial_answer() {
    let base = chunked_sse_server(vec![stalled(&[PARTIAL_FRAME])]).await;
    let store = Arc::new(MemorySessionStore::new());
    let engine = Arc::new(engine_at(
        &base,
        config_at(&base, OPENROUTER_MODEL),
        store.clone(),
        Arc::new(NoTools),
    ));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("hi", Vec::new(), None).await })
    };
    wait_for_last_content(&engine, "Hel").await;
    assert!(engine.is_loading());

    if let Err(e) = engine.stop_response().await {
        panic!("stop failed: {:?}", e);
    }
    match tokio::time::timeout(Duration::from_secs(2), pending).await {
        Ok(Ok(Ok(()))) => {}
        other => panic!("aborted send did not wind down: {:?}", other.map(|r| r.is_ok())),
    }

    let expected = vec![
        (Role::User, Some("hi".to_string())),
        (Role::Assistant, Some("Hel".to_string())),
    ];
    assert_eq!(contents(&engine), expected);
    assert!(!engine.is_loading());

    let id = engine.active_session().map(|h| h.id).unwrap_or_default();
    let saved = match store.load(&scope(), &id).await {
        Ok(s) => s,
        Err(e) => panic!("load failed: {:?}", e),
    };
    assert_eq!(saved.messages.last().and_then(|m| m.content.as_deref()), Some("Hel"));
}

#[tokio::test]
async fn test_superseding_send_keeps_partial_answer() {
    let base = chunked_sse_server(vec![stalled(&[PARTIAL_FRAME]), streamed(&[FRESH_FRAME])]).await;
    let engine = Arc::new(engine_at(
        &base,
        config_at(&base, OPENROUTER_MODEL),
        Arc::new(MemorySessionStore::new()),
        Arc::new(NoTools),
    ));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("hi", Vec::new(), None).await })
    };
    wait_for_last_content(&engine, "Hel").await;

    if let Err(e) = engine.send_chat_message("again", Vec::new(), None).await {
        panic!("second send failed: {:?}", e);
    }
    assert!(tokio::time::timeout(Duration::from_secs(2), pending).await.is_ok());

    assert_eq!(
        contents(&engine),
        vec![
            (Role::User, Some("hi".to_string())),
            (Role::Assistant, Some("Hel".to_string())),
            (Role::User, Some("again".to_string())),
            (Role::Assistant, Some("fresh".to_string())),
        ]
    );
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_refetch_mid_stream_opens_fresh_reply() {
    let base = chunked_sse_server(vec![stalled(&[PARTIAL_FRAME]), streamed(&[FRESH_FRAME])]).await;
    let engine = Arc::new(engine_at(
        &base,
        config_at(&base, OPENROUTER_MODEL),
        Arc::new(MemorySessionStore::new()),
        Arc::new(NoTools),
    ));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("hi", Vec::new(), None).await })
    };
    wait_for_last_content(&engine, "Hel").await;

    if let Err(e) = engine.fetch_response().await {
        panic!("fetch failed: {:?}", e);
    }
    assert!(tokio::time::timeout(Duration::from_secs(2), pending).await.is_ok());

    assert_eq!(
        contents(&engine),
        vec![
            (Role::User, Some("hi".to_string())),
            (Role::Assistant, Some("Hel".to_string())),
            (Role::Assistant, Some("fresh".to_string())),
        ]
    );
    assert!(!engine.is_loading());
}

#[tokio::test]
async fn test_stop_clears_loading_only_after_save() {
    let base = chunked_sse_server(vec![stalled(&[PARTIAL_FRAME])]).await;
    let store = Arc::new(SlowSaveStore::new(Duration::from_millis(600)));
    let engine = Arc::new(engine_at(
        &base,
        config_at(&base, OPENROUTER_MODEL),
        store.clone(),
        Arc::new(NoTools),
    ));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("hi", Vec::new(), None).await })
    };
    wait_for_last_content(&engine, "Hel").await;

    store.slow.store(true, Ordering::SeqCst);
    let stop = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stop_response().await })
    };
    store.save_started.notified().await;
    assert!(engine.is_loading(), "loading cleared before the save landed");
    assert!(!stop.is_finished());

    match tokio::time::timeout(Duration::from_secs(3), stop).await {
        Ok(Ok(Ok(()))) => {}
        other => panic!("stop did not finish: {:?}", other.map(|r| r.is_ok())),
    }
    assert!(!engine.is_loading());
    assert!(tokio::time::timeout(Duration::from_secs(2), pending).await.is_ok());
}

#[tokio::test]
async fn test_delete_during_final_save_stays_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse(&[r#"{"choices":[{"delta":{"content":"ok"}}]}"#]))
        .mount(&server)
        .await;

    let store = Arc::new(SlowSaveStore::new(Duration::from_millis(400)));
    store.slow.store(true, Ordering::SeqCst);
    let engine = Arc::new(engine(
        &server,
        config(&server, OPENROUTER_MODEL),
        store.clone(),
        Arc::new(NoTools),
    ));

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_chat_message("hi", Vec::new(), None).await })
    };
    store.save_started.notified().await;
    let id = match engine.active_session() {
        Some(h) => h.id,
        None => panic!("a session should be active"),
    };

    if let Err(e) = engine.delete_session(&id).await {
        panic!("delete failed: {:?}", e);
    }
    assert!(tokio::time::timeout(Duration::from_secs(2), pending).await.is_ok());

    assert!(engine.active_session().is_none());
    assert!(!engine.is_loading());
    assert!(matches!(
        store.load(&scope(), &id).await.map_err(|e| e.inner),
        Err(ColloquyError::SessionNotFound(_))
    ));
    assert_eq!(store.list(&scope()).await.map(|l| l.len()).ok(), Some(0));
}
