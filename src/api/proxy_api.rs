//! Proxy API
//!
//! Lifecycle of the interception proxy and the contexts it hosts. Starting
//! the proxy opens one mocking session: the rule store, the background
//! process, a relay for the proxied tab, the devtools panel transport with
//! its request log, and the fetch interceptor in front of the real network.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::background::Background;
use crate::bridge::{ContentRelay, PageBridge, PageChannel};
use crate::interceptor::{Fetch, FetchInterceptor};
use crate::panel::{LoggedRequest, MockedRequestLog, PanelTransport};
use crate::proxy::{ProxyConfig, UpstreamFetch};
use crate::storage::{CachedRuleStore, RuleStore, SqliteRuleStore};

// Global proxy state
static PROXY_RUNNING: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));
static ACTIVE_SERVER_TASK: AtomicU64 = AtomicU64::new(0);

/// Current running proxy config (port, bind_address, tab_id)
static CURRENT_PROXY_CONFIG: Lazy<RwLock<(u16, String, u32)>> =
    Lazy::new(|| RwLock::new((9090, "127.0.0.1".to_string(), 1)));

static ACTIVE_SESSION: Lazy<Mutex<Option<Session>>> = Lazy::new(|| Mutex::new(None));

/// Get the version of the GraphQLens core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize the core library (call once at startup)
/// `storage_path` is used to store log files in release mode
#[allow(unused_variables)]
pub fn init_core(storage_path: Option<String>) -> Result<bool, String> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }

    #[cfg(debug_assertions)]
    {
        // Debug mode: log to console (stderr)
        let level = resolve_log_level();
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        // Release mode: log to file
        let level = resolve_log_level();

        let log_dir = storage_path
            .as_ref()
            .map(|p| std::path::PathBuf::from(p).join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));

        std::fs::create_dir_all(&log_dir).map_err(|e| {
            format!(
                "Failed to create log directory {}: {}",
                log_dir.display(),
                e
            )
        })?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "graphqlens_core");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until program exit
        std::mem::forget(_guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("GraphQLens core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(true)
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    level_from_name(std::env::var("RUST_LOG").ok().as_deref())
}

/// Plain level names only; directive syntax falls back to INFO.
fn level_from_name(name: Option<&str>) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match name.map(str::to_lowercase).as_deref() {
        Some("trace") => LevelFilter::TRACE,
        Some("debug") => LevelFilter::DEBUG,
        Some("info") => LevelFilter::INFO,
        Some("warn" | "warning") => LevelFilter::WARN,
        Some("error") => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

pub fn create_default_config() -> ProxyConfig {
    ProxyConfig::default()
}

/// Proxy status information
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    /// Whether the proxy is running
    pub is_running: bool,
    /// Current port
    pub port: u16,
    /// Bind address
    pub bind_address: String,
    /// Tab the proxied traffic is attributed to
    pub tab_id: u32,
    /// Whether the devtools panel currently holds a live port
    pub panel_connected: bool,
    /// Mocked calls reported to the panel since the proxy started
    pub mocked_requests: u64,
}

/// Every context a running proxy hosts.
pub struct Session {
    background: Background,
    relay: JoinHandle<()>,
    panel: PanelTransport,
    log: Arc<MockedRequestLog>,
    interceptor: Arc<FetchInterceptor>,
}

impl Session {
    /// Wire the contexts together for one tab. `upstream` is the real
    /// network the interceptor falls back to.
    pub async fn open(
        store: Arc<dyn RuleStore>,
        upstream: Arc<dyn Fetch>,
        tab_id: u32,
        bridge_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let background = Background::new(store);
        background.install().await?;

        let channel = PageChannel::new();
        let relay = ContentRelay::new(channel.clone(), background.runtime_for_tab(tab_id)).spawn();

        let panel = PanelTransport::new(Arc::new(background.clone()), tab_id);
        let log = Arc::new(MockedRequestLog::default());
        log.attach(&panel);
        panel.connect();

        let bridge = PageBridge::with_timeout(channel, bridge_timeout);
        let interceptor = Arc::new(FetchInterceptor::new(upstream, bridge));

        tracing::info!(tab_id, "mocking session opened");
        Ok(Self {
            background,
            relay,
            panel,
            log,
            interceptor,
        })
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn panel(&self) -> &PanelTransport {
        &self.panel
    }

    pub fn log(&self) -> Arc<MockedRequestLog> {
        Arc::clone(&self.log)
    }

    pub fn interceptor(&self) -> Arc<FetchInterceptor> {
        Arc::clone(&self.interceptor)
    }

    /// Unload the panel, stop the relay and tear down the background.
    pub fn close(self) {
        self.panel.shutdown();
        self.relay.abort();
        self.background.shutdown();
        tracing::info!("mocking session closed");
    }
}

/// Get current proxy status
pub fn get_proxy_status() -> ProxyStatus {
    let (port, bind_address, tab_id) = {
        let config = CURRENT_PROXY_CONFIG
            .read()
            .expect("proxy config lock poisoned");
        (config.0, config.1.clone(), config.2)
    };
    let (panel_connected, mocked_requests) = ACTIVE_SESSION
        .lock()
        .expect("session mutex poisoned")
        .as_ref()
        .map(|s| (s.panel.is_connected(), s.log.total_recorded()))
        .unwrap_or((false, 0));
    ProxyStatus {
        is_running: PROXY_RUNNING.load(Ordering::SeqCst),
        port,
        bind_address,
        tab_id,
        panel_connected,
        mocked_requests,
    }
}

/// Internal helper to check if proxy should keep running
pub fn is_running_internal() -> bool {
    PROXY_RUNNING.load(Ordering::SeqCst)
}

/// Mocked calls the panel has seen in the current session, oldest first.
pub fn get_mocked_requests() -> Vec<LoggedRequest> {
    ACTIVE_SESSION
        .lock()
        .expect("session mutex poisoned")
        .as_ref()
        .map(|s| s.log.entries())
        .unwrap_or_default()
}

/// Start the proxy server
pub async fn start_proxy(config: ProxyConfig) -> Result<bool, String> {
    if PROXY_RUNNING.load(Ordering::SeqCst) {
        tracing::info!("Proxy already running");
        return Ok(true);
    }
    // Find an available port starting from the requested one
    let selected_port = find_available_port(&config.bind_address, config.port, 20).await?;

    if selected_port != config.port {
        tracing::warn!(
            "Port {} in use, falling back to {}",
            config.port,
            selected_port
        );
    }

    let durable = SqliteRuleStore::new(&config.storage_path).map_err(|e| format!("{e:#}"))?;
    let store: Arc<dyn RuleStore> = Arc::new(CachedRuleStore::new(Arc::new(durable)));
    let upstream: Arc<dyn Fetch> = Arc::new(UpstreamFetch::new().map_err(|e| format!("{e:#}"))?);
    let session = Session::open(
        store,
        upstream,
        config.tab_id,
        Duration::from_millis(config.bridge_timeout_ms),
    )
    .await
    .map_err(|e| format!("{e:#}"))?;
    let handler: Arc<dyn Fetch> = session.interceptor();

    {
        let mut active = ACTIVE_SESSION.lock().expect("session mutex poisoned");
        if let Some(previous) = active.replace(session) {
            previous.close();
        }
    }

    PROXY_RUNNING.store(true, Ordering::SeqCst);
    {
        let mut current = CURRENT_PROXY_CONFIG
            .write()
            .expect("proxy config lock poisoned");
        *current = (selected_port, config.bind_address.clone(), config.tab_id);
    }
    tracing::info!(
        "Starting proxy on {}:{}",
        config.bind_address,
        selected_port
    );

    let server_config = ProxyConfig {
        port: selected_port,
        ..config
    };
    let running = Arc::clone(&PROXY_RUNNING);
    ACTIVE_SERVER_TASK.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        if let Err(e) = crate::proxy::run_server(&server_config, handler, running).await {
            tracing::error!("Proxy server error: {}", e);
        }

        // If server exits, ensure flag is cleared
        PROXY_RUNNING.store(false, Ordering::SeqCst);
        ACTIVE_SERVER_TASK.fetch_sub(1, Ordering::SeqCst);
    });

    Ok(true)
}

async fn find_available_port(
    bind_address: &str,
    start_port: u16,
    max_tries: u16,
) -> Result<u16, String> {
    use std::io::ErrorKind;

    for offset in 0..max_tries {
        let candidate = start_port.saturating_add(offset);
        match TcpListener::bind((bind_address, candidate)).await {
            Ok(listener) => {
                drop(listener); // release so the real server can bind
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => continue,
            Err(err) => {
                return Err(format!(
                    "Failed to bind to {}:{}: {}",
                    bind_address, candidate, err
                ))
            }
        }
    }

    Err(format!(
        "No available port found in range {}-{}",
        start_port,
        start_port.saturating_add(max_tries.saturating_sub(1))
    ))
}

/// Stop the proxy server
pub async fn stop_proxy() -> Result<bool, String> {
    tracing::info!("Stopping proxy");
    PROXY_RUNNING.store(false, Ordering::SeqCst);
    loop {
        if ACTIVE_SERVER_TASK.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
    let session = ACTIVE_SESSION.lock().expect("session mutex poisoned").take();
    if let Some(session) = session {
        session.close();
    }
    Ok(true)
}
