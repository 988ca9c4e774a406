//! Loopback HTTP/HTTPS forward proxy.
//!
//! Serves two request shapes: plain HTTP with an absolute URI (clients are
//! configured with this proxy, so origin-form requests are rejected) and
//! `CONNECT host:port` tunnels. Each request becomes an [`Action`], goes
//! through the consent gate, and is then forwarded, tunnelled, or refused
//! with a 403 carrying the verdict reason as JSON.
//!
//! TLS is never terminated here: for encrypted traffic the mediator sees
//! host and port only. The listener binds loopback exclusively.

use crate::gate::ConsentGate;
use crate::policy::types::Action;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bound on reading the request head (line + headers).
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on dialling the upstream.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long in-flight tunnels may drain after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Request headers that must not travel past the proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
];

/// The client connection. Kept buffered end to end: bytes the client sent
/// after the request head (request bodies, an eager TLS hello) sit in the
/// buffer and must reach the upstream.
type ClientStream = BufReader<TcpStream>;

pub struct ProxyServer {
    listener: TcpListener,
    port: u16,
    gate: Arc<ConsentGate>,
}

impl ProxyServer {
    /// Bind the loopback listener. Failing to bind is fatal to startup and
    /// must happen before any kernel rules are installed.
    pub async fn bind(port: u16, gate: Arc<ConsentGate>) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind proxy on 127.0.0.1:{port}"))?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            gate,
        })
    }

    /// The bound port (differs from the requested one when 0 was asked).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept until `shutdown` flips true. Each connection runs in its own
    /// task; in-flight tunnels get [`SHUTDOWN_GRACE`] to drain.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(port = self.port, "proxy listening on loopback");

        loop {
            let mut accept_shutdown = shutdown.clone();
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let gate = Arc::clone(&self.gate);
                            let conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, gate, conn_shutdown).await {
                                    debug!(peer = %peer, error = %e, "proxy connection ended");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "proxy accept error"),
                    }
                }
                _ = wait_shutdown(&mut accept_shutdown) => {
                    info!("proxy no longer accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    gate: Arc<ConsentGate>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut client: ClientStream = BufReader::new(stream);

    let head = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client))
        .await
        .context("timed out reading request head")??;

    let Some(head) = head else {
        return Ok(()); // connection closed before a request arrived
    };

    let parts: Vec<&str> = head.request_line.split_whitespace().collect();
    if parts.len() < 2 {
        respond_simple(&mut client, 400, "Bad Request").await?;
        anyhow::bail!("malformed request line: {}", head.request_line);
    }
    let (method, target) = (parts[0].to_string(), parts[1].to_string());

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, &target, gate, shutdown).await
    } else {
        handle_forward(client, &method, &target, head.headers, gate, shutdown).await
    }
}

struct RequestHead {
    request_line: String,
    headers: Vec<String>,
}

/// Read the request line and headers up to the blank separator.
async fn read_head(client: &mut ClientStream) -> std::io::Result<Option<RequestHead>> {
    let mut request_line = String::new();
    if client.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let request_line = request_line.trim_end().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if client.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            break;
        }
        headers.push(line.trim_end().to_string());
    }
    Ok(Some(RequestHead {
        request_line,
        headers,
    }))
}

/// HTTPS CONNECT: consent, then a blind TCP tunnel.
async fn handle_connect(
    mut client: ClientStream,
    target: &str,
    gate: Arc<ConsentGate>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let Some((host, port)) = parse_connect_target(target) else {
        respond_simple(&mut client, 400, "Bad Request").await?;
        anyhow::bail!("malformed CONNECT target: {target}");
    };

    let action = Action::http(&host, "CONNECT", port, None);
    let verdict = gate.decide(&action).await;
    if !verdict.is_allow() {
        respond_denied(&mut client, &verdict.reason).await?;
        return Ok(());
    }

    let upstream = match dial_upstream(&action.host, port).await {
        Ok(s) => s,
        Err(e) => {
            respond_simple(&mut client, 502, "Bad Gateway").await?;
            anyhow::bail!("upstream connect failed for {}:{port}: {e}", action.host);
        }
    };

    client
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    pipe_until_shutdown(client, upstream, shutdown).await;
    Ok(())
}

/// Plain HTTP: consent, then forward the rewritten request and stream the
/// exchange until either side closes.
async fn handle_forward(
    mut client: ClientStream,
    method: &str,
    target: &str,
    headers: Vec<String>,
    gate: Arc<ConsentGate>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let Some(url) = parse_absolute_url(target) else {
        respond_simple(&mut client, 400, "Bad Request").await?;
        anyhow::bail!("proxy requires an absolute URL, got: {target}");
    };

    let action = Action::http(&url.host, method, url.port, Some(target.to_string()));
    let verdict = gate.decide(&action).await;
    if !verdict.is_allow() {
        respond_denied(&mut client, &verdict.reason).await?;
        return Ok(());
    }

    let mut upstream = match dial_upstream(&action.host, url.port).await {
        Ok(s) => s,
        Err(e) => {
            respond_simple(&mut client, 502, "Bad Gateway").await?;
            anyhow::bail!(
                "upstream connect failed for {}:{}: {e}",
                action.host,
                url.port
            );
        }
    };

    // Rewrite to origin-form and drop hop-by-hop headers. One request per
    // connection, so the upstream is told to close when it is done.
    let mut head = format!("{} {} HTTP/1.1\r\n", action.method, url.path);
    for header in headers.iter().filter(|h| !is_hop_by_hop(h)) {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    upstream.write_all(head.as_bytes()).await?;

    pipe_until_shutdown(client, upstream, shutdown).await;
    Ok(())
}

async fn dial_upstream(host: &str, port: u16) -> Result<TcpStream> {
    tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("connect timed out"))?
        .map_err(Into::into)
}

/// Bidirectional copy, cancellable: once shutdown is signalled the tunnel
/// gets a grace period to drain, then is torn down.
async fn pipe_until_shutdown(
    client: ClientStream,
    upstream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    // Split the buffered side so bytes already read past the head are
    // drained to the upstream first.
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let pump = async {
        let c2u = tokio::io::copy(&mut client_read, &mut upstream_write);
        let u2c = tokio::io::copy(&mut upstream_read, &mut client_write);
        let _ = tokio::join!(c2u, u2c);
    };

    tokio::select! {
        _ = pump => {}
        _ = async {
            wait_shutdown(&mut shutdown).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            debug!("tunnel terminated by shutdown");
        }
    }
}

async fn respond_denied(client: &mut ClientStream, reason: &str) -> std::io::Result<()> {
    let body = serde_json::json!({ "error": "egress denied", "reason": reason }).to_string();
    let response = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    client.get_mut().write_all(response.as_bytes()).await
}

async fn respond_simple(
    client: &mut ClientStream,
    status: u16,
    phrase: &str,
) -> std::io::Result<()> {
    let response =
        format!("HTTP/1.1 {status} {phrase}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    client.get_mut().write_all(response.as_bytes()).await
}

fn is_hop_by_hop(header_line: &str) -> bool {
    let name = header_line.split(':').next().unwrap_or("").trim();
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Parse `host:port` from a CONNECT target. Port defaults to 443.
fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_str)) => (host, port_str.parse().ok()?),
        None => (target, 443),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

/// Parse an absolute `http://host[:port]/path` URL. The proxy does not
/// accept `https://` in plain requests — encrypted traffic uses CONNECT.
fn parse_absolute_url(url: &str) -> Option<ParsedUrl> {
    let rest = url.strip_prefix("http://")?;
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port_str)) => (host, port_str.parse().ok()?),
        None => (host_port, 80),
    };
    if host.is_empty() {
        return None;
    }

    Some(ParsedUrl {
        host: host.to_string(),
        port,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_target() {
        let (host, port) = parse_connect_target("github.com:443").unwrap();
        assert_eq!(host, "github.com");
        assert_eq!(port, 443);

        let (host, port) = parse_connect_target("example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);

        let (host, port) = parse_connect_target("api.example.com:8443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8443);

        assert!(parse_connect_target(":443").is_none());
        assert!(parse_connect_target("host:notaport").is_none());
    }

    #[test]
    fn test_parse_absolute_url() {
        let url = parse_absolute_url("http://example.com/a/b?q=1").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/a/b?q=1");

        let url = parse_absolute_url("http://example.com:8080").unwrap();
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/");

        // origin-form and https are rejected on the plain path
        assert!(parse_absolute_url("/just/a/path").is_none());
        assert!(parse_absolute_url("https://example.com/").is_none());
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Proxy-Connection: keep-alive"));
        assert!(is_hop_by_hop("connection: close"));
        assert!(is_hop_by_hop("Keep-Alive: timeout=5"));
        assert!(!is_hop_by_hop("Host: example.com"));
        assert!(!is_hop_by_hop("Content-Length: 10"));
        assert!(!is_hop_by_hop("Authorization: Bearer x"));
    }
}
