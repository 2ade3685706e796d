#![allow(dead_code)]

use async_trait::async_trait;
use push_relay::adapters::backend::{
    Backend, BackendResponse, Backends, ConnectOptions, ConnectionKind, OutboundRequest, SendReceipt, Transport,
};
use push_relay::adapters::memory::MemoryStore;
use push_relay::config::{Config, StoreClient};
use push_relay::domain::app::{App, AppId, BackendKind, Credential, CredentialMaterial};
use push_relay::domain::feedback::{FeedbackEvent, FeedbackReason};
use push_relay::domain::notification::{Notification, NotificationState, Payload};
use push_relay::error::{Error, Result};
use push_relay::services::reflection::{RecordingHandler, ReflectionHandler};
use push_relay::storage::NotificationStore;
use push_relay::{Engine, EngineBuilder};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("push_relay=debug".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("redis=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

pub fn get_test_config() -> Config {
    let mut config = Config::default();
    config.store.client = StoreClient::Memory;
    config.poller.push_poll = 1;
    config.poller.batch_size = 100;
    config.poller.runner_idle_secs = 60;
    config.delivery.send_timeout_ms = 500;
    config.delivery.shutdown_grace_secs = 2;
    config.delivery.paused_defer_secs = 1;
    config.retry.retry_base_ms = 10;
    config.retry.retry_cap_ms = 100;
    config.retry.max_retries = 3;
    config.connection.reconnect_min_ms = 10;
    config.connection.reconnect_max_ms = 50;
    config.connection.connect_timeout_ms = 500;
    config.credentials.cert_check_interval_secs = 3600;
    config
}

/// What the scripted backend does for one send to a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Deliver,
    Reject(&'static str),
    Transient,
    DropConnection,
    Revoke,
    Hang,
    /// Delivers, and reports that the token has been replaced by this one.
    Canonical(&'static str),
}

#[derive(Debug)]
pub struct ScriptedTransport;

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(&self, _request: OutboundRequest) -> Result<BackendResponse> {
        Ok(BackendResponse { status: 200, ..BackendResponse::default() })
    }

    async fn close(&self) {}
}

/// A backend whose answers are scripted per device token. Tokens without a script deliver.
#[derive(Debug)]
pub struct ScriptedBackend {
    kind: BackendKind,
    kind_of_connection: ConnectionKind,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    sent: Mutex<Vec<String>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            kind_of_connection: ConnectionKind::Multiplexed { max_concurrent: 4 },
            scripts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
        }
    }

    pub fn serial(mut self) -> Self {
        self.kind_of_connection = ConnectionKind::Serial;
        self
    }

    pub fn concurrent(mut self, max_concurrent: usize) -> Self {
        self.kind_of_connection = ConnectionKind::Multiplexed { max_concurrent };
        self
    }

    /// Queues answers for `token`; once used up the token delivers.
    pub fn script(&self, token: &str, answers: impl IntoIterator<Item = Script>) {
        self.scripts.lock().unwrap().entry(token.to_string()).or_default().extend(answers);
    }

    /// Answers `script` for every send to `token`.
    pub fn always(&self, token: &str, script: Script) {
        self.script(token, std::iter::repeat_n(script, 1_000));
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, token: &str) -> usize {
        self.sent.lock().unwrap().iter().filter(|t| *t == token).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn next_script(&self, token: &str) -> Script {
        self.scripts.lock().unwrap().get_mut(token).and_then(VecDeque::pop_front).unwrap_or(Script::Deliver)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connection_kind(&self, _app: &App) -> ConnectionKind {
        self.kind_of_connection
    }

    async fn connect(&self, _app: &App, _options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Connection("connection refused".into()));
        }
        Ok(Arc::new(ScriptedTransport))
    }

    async fn send(&self, _t: &dyn Transport, _app: &App, _n: &Notification, recipient: &str) -> Result<SendReceipt> {
        let script = self.next_script(recipient);
        self.sent.lock().unwrap().push(recipient.to_string());
        match script {
            Script::Deliver => Ok(SendReceipt::default()),
            Script::Canonical(token) => Ok(SendReceipt::canonical(recipient, Some(token.to_string()))),
            Script::Reject(code) => Err(Error::BackendRejected { code: code.into(), description: code.into() }),
            Script::Transient => Err(Error::Transient { code: "Unavailable".into(), description: "busy".into() }),
            Script::DropConnection => Err(Error::Connection("connection reset by peer".into())),
            Script::Revoke => Err(Error::CredentialRevoked("certificate revoked".into())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(SendReceipt::default())
            }
        }
    }

    fn parse_feedback(&self, app: &App, recipient: &str, error: &Error) -> Option<FeedbackEvent> {
        match error {
            Error::BackendRejected { code, .. } if code == "Unregistered" => {
                Some(FeedbackEvent::new(app.id.clone(), recipient, FeedbackReason::Unregistered))
            }
            _ => None,
        }
    }
}

pub fn test_app(id: &str, kind: BackendKind, secret: &str) -> App {
    App::new(id, kind, Credential { material: CredentialMaterial::ApiKey { secret: secret.into() }, expires_at: None })
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub recorder: Arc<RecordingHandler>,
}

/// Builds an engine over a fresh memory store holding `apps`, with `backends` installed.
pub async fn build_engine(config: Config, apps: &[App], backends: Backends) -> TestEngine {
    setup_tracing();
    let store = Arc::new(MemoryStore::new());
    for app in apps {
        store.save_app(app).await.unwrap();
    }
    build_engine_on(config, store, backends).await
}

pub async fn build_engine_on(config: Config, store: Arc<MemoryStore>, backends: Backends) -> TestEngine {
    setup_tracing();
    let recorder = Arc::new(RecordingHandler::new());
    let engine = EngineBuilder::new(config)
        .with_store(Arc::clone(&store) as Arc<dyn NotificationStore>)
        .with_backends(backends)
        .with_handler(Arc::clone(&recorder) as Arc<dyn ReflectionHandler>)
        .build()
        .await
        .expect("engine should build");
    TestEngine { engine, store, recorder }
}

pub async fn submit(engine: &Engine, app: &str, token: &str) -> Uuid {
    let notification = Notification::new(AppId::from(app), token, Payload::alert("hello"));
    engine.submit(&notification).await.unwrap();
    notification.id
}

pub async fn state_of(store: &MemoryStore, id: Uuid) -> Option<NotificationState> {
    store.get(id).await.unwrap().map(|n| n.state)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
