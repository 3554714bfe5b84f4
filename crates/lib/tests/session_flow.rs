//! Integration tests: drive a session task end to end with scripted backends.
//! No network or Ollama required; collaborators are in-process mocks.

use async_trait::async_trait;
use lib::engine::{Engine, EngineError, EngineProvider, GenOptions, LoadEvent, LoadStream, ProgressReport};
use lib::history::{HistoryStore, MemoryStore, Turn};
use lib::llm::{CloudBackend, CloudError};
use lib::runtime::{spawn_session, Event, RuntimeOptions, SessionHandle};
use lib::session::{BackendChoice, ChatSession, ModeState, CLOUD_APOLOGY, LOCAL_APOLOGY};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Cloud mock: fixed reply or failure, optional artificial latency, call count.
struct MockCloud {
    reply: Result<&'static str, &'static str>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockCloud {
    fn new(reply: Result<&'static str, &'static str>) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(reply: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(reply),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudBackend for MockCloud {
    async fn complete(&self, _prompt: &str) -> Result<String, CloudError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.reply {
            Ok(s) => Ok(s.to_string()),
            Err(e) => Err(CloudError::Api(e.to_string())),
        }
    }
}

/// Engine whose generate returns a canned raw string or fails.
struct TestEngine {
    raw: Result<&'static str, &'static str>,
}

#[async_trait]
impl Engine for TestEngine {
    async fn generate(&self, _prompt: &str, _options: &GenOptions) -> Result<String, EngineError> {
        match self.raw {
            Ok(s) => Ok(s.to_string()),
            Err(e) => Err(EngineError::Generate(e.to_string())),
        }
    }
}

#[derive(Clone, Copy)]
enum Script {
    /// Load succeeds; the engine answers with this raw text.
    Ready(&'static str),
    /// Load succeeds; the engine fails every generate call.
    ReadyFailing,
    /// Load fails with an engine error.
    Fail,
    /// Load never terminates (candidate for timeout/cancel).
    Hang,
}

/// Provider with a scripted outcome per model id; records load order.
struct ScriptedProvider {
    available: bool,
    script: HashMap<String, Script>,
    loads: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(available: bool, script: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            available,
            script: script.iter().map(|(m, s)| (m.to_string(), *s)).collect(),
            loads: Mutex::new(Vec::new()),
        })
    }

    fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EngineProvider for ScriptedProvider {
    async fn available(&self) -> bool {
        self.available
    }

    fn load(&self, model_id: &str) -> LoadStream {
        self.loads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(model_id.to_string());
        let script = self.script.get(model_id).copied().unwrap_or(Script::Fail);
        Box::pin(async_stream::stream! {
            match script {
                Script::Ready(raw) => {
                    yield LoadEvent::Progress(ProgressReport {
                        text: "Fetching model".to_string(),
                        progress: Some(0.2),
                    });
                    yield LoadEvent::Ready(Arc::new(TestEngine { raw: Ok(raw) }));
                }
                Script::ReadyFailing => {
                    yield LoadEvent::Ready(Arc::new(TestEngine { raw: Err("oom") }));
                }
                Script::Fail => {
                    yield LoadEvent::Failed(EngineError::Load("no such model".to_string()));
                }
                Script::Hang => {
                    std::future::pending::<()>().await;
                }
            }
        })
    }
}

fn opts(candidates: &[&str], load_timeout: Duration) -> RuntimeOptions {
    RuntimeOptions {
        candidates: candidates.iter().map(|s| s.to_string()).collect(),
        load_timeout,
        gen_options: GenOptions {
            max_length: 256,
            temperature: 0.7,
            top_p: 0.9,
        },
    }
}

fn start(
    backing: MemoryStore,
    cloud: Arc<MockCloud>,
    provider: Arc<ScriptedProvider>,
    options: RuntimeOptions,
) -> (SessionHandle, UnboundedReceiver<Event>) {
    let session = ChatSession::new(HistoryStore::open(Box::new(backing)));
    spawn_session(session, cloud, provider, options)
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until the next bot turn.
async fn wait_for_bot(rx: &mut UnboundedReceiver<Event>) -> Turn {
    loop {
        if let Event::BotTurn(turn) = next_event(rx).await {
            return turn;
        }
    }
}

/// Skip events until the mode changes to the expected state; returns the
/// active model reported with it.
async fn wait_for_mode(rx: &mut UnboundedReceiver<Event>, expected: ModeState) -> Option<String> {
    loop {
        if let Event::ModeChanged { mode, model } = next_event(rx).await {
            if mode == expected {
                return model;
            }
        }
    }
}

/// Skip events until a notice arrives.
async fn wait_for_notice(rx: &mut UnboundedReceiver<Event>) -> String {
    loop {
        if let Event::Notice(text) = next_event(rx).await {
            return text;
        }
    }
}

#[tokio::test]
async fn cloud_happy_path_appends_and_persists() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("Hi there"));
    let provider = ScriptedProvider::new(true, &[]);
    let (handle, mut rx) = start(
        backing.clone(),
        cloud.clone(),
        provider,
        opts(&[], Duration::from_secs(1)),
    );

    handle.send("Hello");

    let Event::UserTurn(user) = next_event(&mut rx).await else {
        panic!("expected the user turn first");
    };
    assert_eq!(user.text, "Hello");
    assert!(user.from_user);
    assert!(matches!(next_event(&mut rx).await, Event::TurnStarted));
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, "Hi there");
    assert!(!bot.from_user);

    let turns = handle.history().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].text, "Hello");
    assert_eq!(turns[1].text, "Hi there");

    // Both sides persisted: a reopened store sees the same sequence.
    let reopened = HistoryStore::open(Box::new(backing));
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.all()[1].text, "Hi there");
    assert_eq!(cloud.calls(), 1);
}

#[tokio::test]
async fn second_send_while_in_flight_is_a_noop() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::slow("done", Duration::from_millis(150));
    let provider = ScriptedProvider::new(true, &[]);
    let (handle, mut rx) = start(
        backing,
        cloud.clone(),
        provider,
        opts(&[], Duration::from_secs(1)),
    );

    handle.send("first");
    handle.send("second");

    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, "done");
    assert_eq!(cloud.calls(), 1);

    // Only the first exchange exists; the second send never became a turn.
    let turns = handle.history().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].text, "first");

    // Once settled, sending works again.
    handle.send("third");
    wait_for_bot(&mut rx).await;
    assert_eq!(cloud.calls(), 2);
    assert_eq!(handle.history().await.len(), 4);
}

#[tokio::test]
async fn bootstrap_falls_back_to_second_candidate_and_serves_locally() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("from cloud"));
    let provider = ScriptedProvider::new(
        true,
        &[("alpha", Script::Fail), ("beta", Script::Ready("<|assistant|>from local</s>"))],
    );
    let (handle, mut rx) = start(
        backing,
        cloud.clone(),
        provider.clone(),
        opts(&["alpha", "beta"], Duration::from_secs(2)),
    );

    handle.select_backend(BackendChoice::Local);
    assert_eq!(wait_for_mode(&mut rx, ModeState::LocalLoading).await, None);
    let model = wait_for_mode(&mut rx, ModeState::LocalReady).await;
    assert_eq!(model.as_deref(), Some("beta"));
    assert_eq!(provider.loads(), vec!["alpha", "beta"]);

    let state = handle.state().await.expect("snapshot");
    assert_eq!(state.mode, ModeState::LocalReady);
    assert_eq!(state.active_model.as_deref(), Some("beta"));

    // Replies now come from the local engine, cleaned of template markers.
    handle.send("hi");
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, "from local");
    assert_eq!(cloud.calls(), 0);
}

#[tokio::test]
async fn bootstrap_timeout_reverts_to_cloud() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("cloud still works"));
    let provider = ScriptedProvider::new(true, &[("alpha", Script::Hang)]);
    let (handle, mut rx) = start(
        backing,
        cloud.clone(),
        provider,
        opts(&["alpha"], Duration::from_millis(50)),
    );

    handle.select_backend(BackendChoice::Local);
    wait_for_mode(&mut rx, ModeState::LocalLoading).await;
    let notice = wait_for_notice(&mut rx).await;
    assert!(notice.contains("timed out"), "unexpected notice: {notice}");
    wait_for_mode(&mut rx, ModeState::Cloud).await;

    let state = handle.state().await.expect("snapshot");
    assert_eq!(state.mode, ModeState::Cloud);
    assert!(state.active_model.is_none());
    assert!(!state.loading);

    handle.send("hello");
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, "cloud still works");
    assert_eq!(cloud.calls(), 1);
}

#[tokio::test]
async fn cancel_during_load_aborts_without_next_candidate() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("unused"));
    let provider = ScriptedProvider::new(
        true,
        &[("alpha", Script::Hang), ("beta", Script::Ready("x"))],
    );
    let (handle, mut rx) = start(
        backing,
        cloud,
        provider.clone(),
        opts(&["alpha", "beta"], Duration::from_secs(30)),
    );

    handle.select_backend(BackendChoice::Local);
    wait_for_mode(&mut rx, ModeState::LocalLoading).await;
    handle.cancel_load();

    let notice = wait_for_notice(&mut rx).await;
    assert!(notice.contains("cancelled"), "unexpected notice: {notice}");
    wait_for_mode(&mut rx, ModeState::Cloud).await;
    assert_eq!(provider.loads(), vec!["alpha"]);
}

#[tokio::test]
async fn selecting_cloud_mid_load_cancels_too() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("unused"));
    let provider = ScriptedProvider::new(true, &[("alpha", Script::Hang)]);
    let (handle, mut rx) = start(
        backing,
        cloud,
        provider,
        opts(&["alpha"], Duration::from_secs(30)),
    );

    handle.select_backend(BackendChoice::Local);
    wait_for_mode(&mut rx, ModeState::LocalLoading).await;
    handle.select_backend(BackendChoice::Cloud);

    let notice = wait_for_notice(&mut rx).await;
    assert!(notice.contains("cancelled"), "unexpected notice: {notice}");
    wait_for_mode(&mut rx, ModeState::Cloud).await;
}

#[tokio::test]
async fn local_generation_failure_downgrades_once() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("cloud reply"));
    let provider = ScriptedProvider::new(true, &[("alpha", Script::ReadyFailing)]);
    let (handle, mut rx) = start(
        backing,
        cloud.clone(),
        provider,
        opts(&["alpha"], Duration::from_secs(2)),
    );

    handle.select_backend(BackendChoice::Local);
    wait_for_mode(&mut rx, ModeState::LocalReady).await;

    handle.send("hi");
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, LOCAL_APOLOGY);
    wait_for_mode(&mut rx, ModeState::Cloud).await;

    // Exactly one apology turn; order intact; lock released.
    let turns = handle.history().await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].text, "hi");
    assert_eq!(turns[1].text, LOCAL_APOLOGY);

    let state = handle.state().await.expect("snapshot");
    assert_eq!(state.mode, ModeState::Cloud);
    assert!(state.active_model.is_none());
    assert!(!state.generating);

    // No automatic retry: the next message goes to the cloud.
    handle.send("again");
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, "cloud reply");
    assert_eq!(cloud.calls(), 1);
}

#[tokio::test]
async fn cloud_failure_appends_apology_without_downgrade() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Err("boom"));
    let provider = ScriptedProvider::new(true, &[]);
    let (handle, mut rx) = start(
        backing,
        cloud,
        provider,
        opts(&[], Duration::from_secs(1)),
    );

    handle.send("hello");
    let bot = wait_for_bot(&mut rx).await;
    assert_eq!(bot.text, CLOUD_APOLOGY);

    let state = handle.state().await.expect("snapshot");
    assert_eq!(state.mode, ModeState::Cloud);
    assert!(!state.generating);
}

#[tokio::test]
async fn attachment_rides_the_user_turn_and_clears() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("nice picture"));
    let provider = ScriptedProvider::new(true, &[]);
    let (handle, mut rx) = start(
        backing.clone(),
        cloud,
        provider,
        opts(&[], Duration::from_secs(1)),
    );

    handle.attach(lib::attachment::PendingAttachment {
        data_uri: "data:image/png;base64,AAAA".to_string(),
        filename: "cat.png".to_string(),
    });
    handle.send("look");

    let Event::UserTurn(user) = next_event(&mut rx).await else {
        panic!("expected the user turn first");
    };
    assert_eq!(user.image.as_deref(), Some("data:image/png;base64,AAAA"));
    wait_for_bot(&mut rx).await;

    // Store cleared: the next turn carries no image.
    handle.send("no image now");
    let Event::UserTurn(user) = next_event(&mut rx).await else {
        panic!("expected the user turn first");
    };
    assert!(user.image.is_none());
    wait_for_bot(&mut rx).await;

    // The image was persisted with its turn.
    let reopened = HistoryStore::open(Box::new(backing));
    assert_eq!(
        reopened.all()[0].image.as_deref(),
        Some("data:image/png;base64,AAAA")
    );
}

#[tokio::test]
async fn unavailable_capability_fails_fast_and_is_reported() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("unused"));
    let provider = ScriptedProvider::new(false, &[("alpha", Script::Ready("x"))]);
    let (handle, mut rx) = start(
        backing,
        cloud,
        provider.clone(),
        opts(&["alpha"], Duration::from_secs(1)),
    );

    let state = handle.state().await.expect("snapshot");
    assert!(!state.local_available);

    // Even if asked, the bootstrap fails fast without a load attempt.
    handle.select_backend(BackendChoice::Local);
    let notice = wait_for_notice(&mut rx).await;
    assert!(notice.contains("unavailable"), "unexpected notice: {notice}");
    wait_for_mode(&mut rx, ModeState::Cloud).await;
    assert!(provider.loads().is_empty());
}

#[tokio::test]
async fn reset_clears_history_and_persists_empty() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("hi"));
    let provider = ScriptedProvider::new(true, &[]);
    let (handle, mut rx) = start(
        backing.clone(),
        cloud,
        provider,
        opts(&[], Duration::from_secs(1)),
    );

    handle.send("hello");
    wait_for_bot(&mut rx).await;
    assert_eq!(handle.history().await.len(), 2);

    handle.reset_history();
    loop {
        if matches!(next_event(&mut rx).await, Event::HistoryCleared) {
            break;
        }
    }
    assert!(handle.history().await.is_empty());

    let reopened = HistoryStore::open(Box::new(backing));
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn load_progress_is_forwarded_during_bootstrap() {
    let backing = MemoryStore::new();
    let cloud = MockCloud::new(Ok("unused"));
    let provider = ScriptedProvider::new(true, &[("alpha", Script::Ready("x"))]);
    let (handle, mut rx) = start(
        backing,
        cloud,
        provider,
        opts(&["alpha"], Duration::from_secs(2)),
    );

    handle.select_backend(BackendChoice::Local);
    let progress = loop {
        match next_event(&mut rx).await {
            Event::LoadProgress { model_id, text, .. } => break (model_id, text),
            Event::ModeChanged { mode: ModeState::LocalReady, .. } => {
                panic!("ready arrived before any progress event")
            }
            _ => {}
        }
    };
    assert_eq!(progress.0, "alpha");
    assert_eq!(progress.1, "Fetching model");
    wait_for_mode(&mut rx, ModeState::LocalReady).await;
}
