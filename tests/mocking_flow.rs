use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use graphqlens_core::background::Background;
use graphqlens_core::bridge::{ContentRelay, PageBridge, PageChannel};
use graphqlens_core::interceptor::{Fetch, FetchInterceptor};
use graphqlens_core::models::{
    FetchRequest, FetchResponse, MessageSender, Rule, RulesPayload, RuntimeMessage,
};
use graphqlens_core::panel::{MockedRequestLog, PanelTransport, PortState};
use graphqlens_core::proxy::{handle_connection, UpstreamFetch};
use graphqlens_core::storage::{self, MemoryRuleStore, RuleStore};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const URL: &str = "https://api.example.com/graphql";

#[derive(Default)]
struct Network {
    calls: AtomicUsize,
}

impl Fetch for Network {
    fn fetch(&self, _request: FetchRequest) -> BoxFuture<'_, anyhow::Result<FetchResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = FetchResponse::json(200, &json!({"data": {"source": "network"}}))
            .map_err(anyhow::Error::from);
        Box::pin(async move { response })
    }
}

fn rule(id: &str, vars: Option<Value>, response: Value) -> Rule {
    Rule {
        id: id.into(),
        operation_name: "GetUser".into(),
        endpoint: "/graphql".into(),
        status_code: 200,
        response,
        variables: vars.and_then(|v| v.as_object().cloned()),
    }
}

/// Page, relay, background and panel for one tab.
struct Harness {
    background: Background,
    panel: PanelTransport,
    log: Arc<MockedRequestLog>,
    page: FetchInterceptor,
    network: Arc<Network>,
}

impl Harness {
    async fn new(tab_id: u32) -> Self {
        let background = Background::new(Arc::new(MemoryRuleStore::new()));
        background.install().await.unwrap();
        Self::attach(background, tab_id, tab_id).await
    }

    /// `page_tab` is where the page runs, `panel_tab` the tab the panel
    /// inspects.
    async fn attach(background: Background, page_tab: u32, panel_tab: u32) -> Self {
        let channel = PageChannel::new();
        ContentRelay::new(channel.clone(), background.runtime_for_tab(page_tab)).spawn();

        let panel = PanelTransport::new(Arc::new(background.clone()), panel_tab);
        let log = Arc::new(MockedRequestLog::default());
        log.attach(&panel);
        panel.connect();
        eventually(|| background.devtools_port(panel_tab).is_some()).await;

        let network = Arc::new(Network::default());
        let page = FetchInterceptor::new(network.clone(), PageBridge::new(channel));
        Self {
            background,
            panel,
            log,
            page,
            network,
        }
    }

    async fn set_rules(&self, rules: Vec<Rule>, enabled: bool) {
        let sender = MessageSender::default();
        self.background
            .handle_message(RuntimeMessage::SetRules { rules }, sender)
            .await;
        self.background
            .handle_message(RuntimeMessage::SetEnabled { enabled }, sender)
            .await;
    }

    async fn call(&self, body: &str) -> FetchResponse {
        self.page
            .handle(FetchRequest::post(URL, body.to_string()))
            .await
            .unwrap()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn mocked_call_reaches_the_panel() {
    let h = Harness::new(3).await;
    h.set_rules(
        vec![rule("wild", None, json!({"data": {"user": null}}))],
        true,
    )
    .await;

    let response = h
        .call(r#"{"operationName":"GetUser","variables":{"id":"1"}}"#)
        .await;
    assert!(response.mocked);
    assert_eq!(response.body_json().unwrap(), json!({"data": {"user": null}}));
    assert_eq!(h.network.calls.load(Ordering::SeqCst), 0);

    eventually(|| h.log.len() == 1).await;
    let entry = &h.log.entries()[0];
    assert_eq!(entry.url, URL);
    assert_eq!(entry.operation_name, "GetUser");
    assert_eq!(entry.status_code, 200);
}

#[tokio::test]
async fn specific_rule_wins_and_others_fall_back() {
    let h = Harness::new(3).await;
    h.set_rules(
        vec![
            rule("wild", None, json!({"data": {"who": "anyone"}})),
            rule("one", Some(json!({"id": "1"})), json!({"data": {"who": "one"}})),
        ],
        true,
    )
    .await;

    let one = h
        .call(r#"{"operationName":"GetUser","variables":{"id":"1"}}"#)
        .await;
    assert_eq!(one.body_json().unwrap()["data"]["who"], "one");

    let two = h
        .call(r#"{"operationName":"GetUser","variables":{"id":"2"}}"#)
        .await;
    assert_eq!(two.body_json().unwrap()["data"]["who"], "anyone");

    let other = h.call(r#"{"operationName":"Viewer"}"#).await;
    assert!(!other.mocked);
    assert_eq!(h.network.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mocking_switch_off_passes_everything_through() {
    let h = Harness::new(3).await;
    h.set_rules(vec![rule("wild", None, json!({}))], false).await;

    let response = h.call(r#"{"operationName":"GetUser"}"#).await;
    assert!(!response.mocked);
    assert_eq!(h.network.calls.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn notifications_only_reach_the_inspecting_panel() {
    let background = Background::new(Arc::new(MemoryRuleStore::new()));
    background.install().await.unwrap();
    let inspected = Harness::attach(background.clone(), 5, 5).await;
    let elsewhere = Harness::attach(background.clone(), 6, 9).await;
    inspected
        .set_rules(vec![rule("wild", None, json!({"data": {}}))], true)
        .await;

    assert!(elsewhere.call(r#"{"operationName":"GetUser"}"#).await.mocked);
    assert!(inspected.call(r#"{"operationName":"GetUser"}"#).await.mocked);

    eventually(|| inspected.log.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(inspected.log.len(), 1);
    assert!(elsewhere.log.is_empty());
}

#[tokio::test]
async fn panel_reconnect_keeps_receiving() {
    let h = Harness::new(3).await;
    h.set_rules(vec![rule("wild", None, json!({"data": {}}))], true)
        .await;

    // Simulate the background dropping the panel's port.
    let port = h.background.devtools_port(3).unwrap();
    port.disconnect();
    eventually(|| h.panel.state() == PortState::ReconnectScheduled).await;
    eventually(|| h.panel.state() == PortState::Connected).await;
    eventually(|| {
        h.background
            .devtools_port(3)
            .is_some_and(|p| p.port_id() != port.port_id())
    })
    .await;

    h.call(r#"{"operationName":"GetUser"}"#).await;
    eventually(|| h.log.len() == 1).await;
}

#[tokio::test]
async fn background_gone_means_pass_through() {
    let h = Harness::new(3).await;
    h.set_rules(vec![rule("wild", None, json!({"data": {}}))], true)
        .await;
    h.background.shutdown();

    let response = h.call(r#"{"operationName":"GetUser"}"#).await;
    assert!(!response.mocked);
    assert_eq!(h.network.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_serves_mocks_and_forwards_the_rest() {
    // Origin server for the pass-through request.
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nupstream")
            .await
            .unwrap();
    });

    let background = Background::new(Arc::new(MemoryRuleStore::new()));
    background.install().await.unwrap();
    let channel = PageChannel::new();
    ContentRelay::new(channel.clone(), background.runtime_for_tab(1)).spawn();
    let interceptor: Arc<dyn Fetch> = Arc::new(FetchInterceptor::new(
        Arc::new(UpstreamFetch::new().unwrap()),
        PageBridge::new(channel),
    ));
    let store = background.store();
    storage::save_rules(
        store.as_ref(),
        &[rule("wild", None, json!({"data": {"mocked": true}}))],
    )
    .await
    .unwrap();
    storage::save_enabled(store.as_ref(), true).await.unwrap();

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(handle_connection(server, interceptor));

    let body = r#"{"operationName":"GetUser","query":"query GetUser { user { id } }"}"#;
    let mocked = format!(
        "POST http://{origin_addr}/graphql HTTP/1.1\r\nHost: {origin_addr}\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    client.write_all(mocked.as_bytes()).await.unwrap();
    let first = read_until(&mut client, b"{\"data\":{\"mocked\":true}}").await;
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(first.contains("Content-Type: application/json"));

    let passthrough = format!(
        "GET http://{origin_addr}/health HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(passthrough.as_bytes()).await.unwrap();
    let second = read_until(&mut client, b"upstream").await;
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
}

async fn read_until(stream: &mut tokio::io::DuplexStream, needle: &[u8]) -> String {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while !seen.windows(needle.len()).any(|w| w == needle) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("response in time")
            .unwrap();
        assert!(n > 0, "stream closed early");
        seen.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&seen).to_string()
}

#[test]
fn defaults_are_installed_once() {
    let store = MemoryRuleStore::new();
    tokio_test::block_on(async {
        storage::install_defaults(&store).await.unwrap();
        assert_eq!(storage::load_payload(&store).await, RulesPayload::disabled());

        storage::save_enabled(&store, true).await.unwrap();
        storage::install_defaults(&store).await.unwrap();
        let payload = storage::load_payload(&store).await;
        assert!(payload.gql_enabled);
        assert!(payload.gql_rules.is_empty());

        let raw = store.get(vec![storage::RULES_KEY.to_string()]).await.unwrap();
        assert_eq!(raw.get(storage::RULES_KEY), Some(&json!([])));
    });
}
