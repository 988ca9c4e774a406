//! End-to-end tests for the forward proxy: a real loopback listener, a
//! stub upstream, and fake consent channels standing in for the human.

use acp::audit::{AuditReader, AuditSink};
use acp::channel::{AutoDeny, ChannelError, ChannelReply, ConsentChannel};
use acp::gate::ConsentGate;
use acp::policy::parser::parse_policy_str;
use acp::policy::types::Action;
use acp::policy::PolicyEngine;
use acp::proxy::ProxyServer;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct CountingApprove {
    asks: AtomicUsize,
}

impl CountingApprove {
    fn new() -> Self {
        Self {
            asks: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.asks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentChannel for CountingApprove {
    fn name(&self) -> &'static str {
        "counting-approve"
    }

    async fn ask(
        &self,
        _action: &Action,
        _timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        self.asks.fetch_add(1, Ordering::SeqCst);
        Ok(ChannelReply::approved("approved by test human"))
    }
}

struct Harness {
    proxy_port: u16,
    audit_path: PathBuf,
    _tmp: TempDir,
    shutdown: watch::Sender<bool>,
}

/// Start a proxy wired to the given channel and policy.
async fn start_proxy(channel: Arc<dyn ConsentChannel>, yaml: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let audit_path = tmp.path().join("audit.jsonl");
    let audit = Arc::new(AuditSink::open(&audit_path).unwrap());
    let engine = PolicyEngine::new(parse_policy_str(yaml).unwrap()).unwrap();
    let gate = Arc::new(ConsentGate::new(engine, channel, audit));

    let proxy = ProxyServer::bind(0, gate).await.unwrap();
    let proxy_port = proxy.port();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(proxy.run(shutdown_rx));

    Harness {
        proxy_port,
        audit_path,
        _tmp: tmp,
        shutdown,
    }
}

impl Harness {
    fn audit_entries(&self) -> Vec<acp::audit::AuditEntry> {
        AuditReader::new(&self.audit_path).read_all().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Echo server: whatever arrives goes straight back.
async fn spawn_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Minimal HTTP upstream: records the request head, answers 200.
async fn spawn_http_upstream() -> (u16, Arc<tokio::sync::Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = Arc::clone(&seen_writer);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                seen.lock().await.push(head);
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    (port, seen)
}

async fn proxy_client(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// Read the single small response head (tunnel stays open afterwards).
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

/// Read everything until the proxy closes the connection. Used on paths
/// where the proxy answers `Connection: close`.
async fn read_until_close(stream: &mut TcpStream) -> String {
    stream.shutdown().await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

// ── Scenario: allowed host, no prompt ──

#[tokio::test]
async fn connect_to_allowed_host_tunnels_without_prompt() {
    let upstream_port = spawn_echo_upstream().await;
    let channel = Arc::new(CountingApprove::new());
    let harness = start_proxy(
        channel.clone(),
        r#"
default: ask
rules:
  - match: { kind: http, host: "127.0.0.1" }
    action: allow
"#,
    )
    .await;

    let mut client = proxy_client(harness.proxy_port).await;
    client
        .write_all(format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    // Tunnel is transparent both ways.
    client.write_all(b"ping through tunnel").await.unwrap();
    let mut echoed = vec![0u8; 19];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through tunnel");

    assert_eq!(channel.count(), 0, "allow rule must not prompt");

    let entries = harness.audit_entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_allow());
    assert!(entries[0].verdict.reason.contains("policy rule"));
    assert_eq!(entries[0].action.name, "CONNECT");
}

// ── Scenario: unknown host, human approves, second request cached ──

#[tokio::test]
async fn approval_is_cached_for_the_next_connect() {
    let upstream_port = spawn_echo_upstream().await;
    let channel = Arc::new(CountingApprove::new());
    let harness = start_proxy(channel.clone(), "default: ask\n").await;

    for _ in 0..2 {
        let mut client = proxy_client(harness.proxy_port).await;
        client
            .write_all(format!("CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    }

    assert_eq!(channel.count(), 1, "second CONNECT must come from the cache");

    let entries = harness.audit_entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[1].verdict.reason.contains("cached host approval"));
}

// ── Scenario: unknown host, human denies ──

#[tokio::test]
async fn denied_request_gets_403_with_reason() {
    let harness = start_proxy(Arc::new(AutoDeny), "default: ask\n").await;

    let mut client = proxy_client(harness.proxy_port).await;
    client
        .write_all(b"GET http://evil.test/x HTTP/1.1\r\nHost: evil.test\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    let body_start = response.find("\r\n\r\n").unwrap() + 4;
    let body: serde_json::Value = serde_json::from_str(&response[body_start..]).unwrap();
    assert_eq!(body["reason"], "auto-denied");

    let entries = harness.audit_entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_allow());
    assert_eq!(entries[0].action.meta.host, "evil.test");
}

// ── Scenario: deny rule beats later ask, channel untouched ──

#[tokio::test]
async fn deny_rule_short_circuits_without_prompt() {
    let channel = Arc::new(CountingApprove::new());
    let harness = start_proxy(
        channel.clone(),
        r#"
default: ask
rules:
  - match: { kind: http, host: "*.evil.com" }
    action: deny
  - match: { kind: http }
    action: ask
"#,
    )
    .await;

    let mut client = proxy_client(harness.proxy_port).await;
    client
        .write_all(b"CONNECT x.evil.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert_eq!(channel.count(), 0);

    let entries = harness.audit_entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].is_allow());
}

// ── Plain HTTP forwarding ──

#[tokio::test]
async fn plain_http_is_rewritten_and_forwarded() {
    let (upstream_port, seen) = spawn_http_upstream().await;
    let harness = start_proxy(
        Arc::new(CountingApprove::new()),
        r#"
default: ask
rules:
  - match: { kind: http, host: "127.0.0.1" }
    action: allow
"#,
    )
    .await;

    let mut client = proxy_client(harness.proxy_port).await;
    let request = format!(
        "GET http://127.0.0.1:{upstream_port}/hello HTTP/1.1\r\n\
         Host: 127.0.0.1:{upstream_port}\r\n\
         Proxy-Connection: keep-alive\r\n\
         X-Custom: kept\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = read_until_close(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("ok"));

    let seen = seen.lock().await;
    let forwarded = &seen[0];
    // Origin-form request line, hop-by-hop gone, end-to-end kept.
    assert!(forwarded.starts_with("GET /hello HTTP/1.1\r\n"), "got: {forwarded}");
    assert!(!forwarded.to_lowercase().contains("proxy-connection"));
    assert!(forwarded.contains("X-Custom: kept"));

    let entries = harness.audit_entries();
    assert_eq!(entries[0].action.name, "GET");
    assert_eq!(
        entries[0].action.meta.url.as_deref(),
        Some(format!("http://127.0.0.1:{upstream_port}/hello").as_str())
    );
}

// ── Upstream failure after an allowed verdict ──

#[tokio::test]
async fn unreachable_upstream_is_502() {
    // Grab a port nobody listens on.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let harness = start_proxy(
        Arc::new(CountingApprove::new()),
        r#"
default: ask
rules:
  - match: { kind: http, host: "127.0.0.1" }
    action: allow
"#,
    )
    .await;

    let mut client = proxy_client(harness.proxy_port).await;
    client
        .write_all(format!("CONNECT 127.0.0.1:{dead_port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");

    // The verdict was allow; the audit records it before the dial failed.
    let entries = harness.audit_entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_allow());
}

// ── Malformed input ──

#[tokio::test]
async fn origin_form_request_is_rejected() {
    let harness = start_proxy(Arc::new(CountingApprove::new()), "default: allow\n").await;

    let mut client = proxy_client(harness.proxy_port).await;
    client
        .write_all(b"GET /not-absolute HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_close(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
    assert!(harness.audit_entries().is_empty());
}
