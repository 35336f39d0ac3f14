//! HTTP status probe.
//!
//! Each pooled context keeps one keep-alive HTTP/1 connection per target
//! authority. A target answers `GET <url>` with a JSON body:
//!
//! ```json
//! {"authorized": 12, "unauthorized": 1, "ip": "10.0.0.7"}
//! ```
//!
//! `ip` is optional; the connection's peer address is reported instead.
//! Reusing a connection the server has closed is a `Disconnected` error so
//! the pool evicts the whole context.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::debug;

use probegrid_core::{BoxFuture, Probe, ProbeError, ProbeOutcome, Target};

const USER_AGENT: &str = concat!("probegridd/", env!("CARGO_PKG_VERSION"));

/// Body returned by a target's status endpoint.
#[derive(Debug, Deserialize)]
struct StatusBody {
    authorized: u32,
    unauthorized: u32,
    #[serde(default)]
    ip: Option<String>,
}

struct Connection {
    sender: SendRequest<Empty<Bytes>>,
    peer: SocketAddr,
}

/// Open connections, keyed by `host:port`.
#[derive(Default)]
pub struct HttpSession {
    connections: HashMap<String, Connection>,
}

impl HttpSession {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Probes targets over plain HTTP/1.1.
#[derive(Debug, Default)]
pub struct HttpProbe;

impl HttpProbe {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, session: &mut HttpSession, target: &Target) -> Result<ProbeOutcome, ProbeError> {
        let uri: http::Uri = target
            .url
            .parse()
            .map_err(|e| ProbeError::Transient(format!("invalid url {}: {e}", target.url)))?;
        if uri.scheme_str() != Some("http") {
            return Err(ProbeError::Transient(format!(
                "unsupported scheme in {}",
                target.url
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| ProbeError::Transient(format!("no host in {}", target.url)))?;
        let port = uri.port_u16().unwrap_or(80);
        let authority = format!("{host}:{port}");

        if session
            .connections
            .get(&authority)
            .is_some_and(|c| c.sender.is_closed())
        {
            session.connections.remove(&authority);
            return Err(ProbeError::Disconnected(format!(
                "connection to {authority} closed by peer"
            )));
        }
        if !session.connections.contains_key(&authority) {
            let conn = connect(host, port, &authority).await?;
            session.connections.insert(authority.clone(), conn);
        }
        let Some(conn) = session.connections.get_mut(&authority) else {
            return Err(ProbeError::Transient(format!("no connection to {authority}")));
        };

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", &authority)
            .header("user-agent", USER_AGENT)
            .header("accept", "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::Transient(format!("bad request for {}: {e}", target.url)))?;

        if let Err(e) = conn.sender.ready().await {
            session.connections.remove(&authority);
            return Err(ProbeError::Disconnected(format!("{authority}: {e}")));
        }
        let resp = match conn.sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) if e.is_closed() || e.is_canceled() || e.is_incomplete_message() => {
                session.connections.remove(&authority);
                return Err(ProbeError::Disconnected(format!("{authority}: {e}")));
            }
            Err(e) => return Err(ProbeError::Transient(format!("{}: {e}", target.url))),
        };
        let peer = conn.peer;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::Transient(format!("{}: reading body: {e}", target.url)))?
            .to_bytes();
        if !status.is_success() {
            debug!(target_url = %target.url, %status, "status endpoint returned non-2xx");
            return Err(ProbeError::Transient(format!("{}: HTTP {status}", target.url)));
        }

        let mut outcome = parse_status(&body)
            .map_err(|e| ProbeError::Transient(format!("{}: {e}", target.url)))?;
        if outcome.ip.is_none() {
            outcome.ip = Some(peer.ip().to_string());
        }
        Ok(outcome)
    }
}

async fn connect(host: &str, port: u16, authority: &str) -> Result<Connection, ProbeError> {
    let stream = tokio::net::TcpStream::connect((host, port))
        .await
        .map_err(|e| ProbeError::Transient(format!("connect {authority}: {e}")))?;
    let peer = stream
        .peer_addr()
        .map_err(|e| ProbeError::Transient(format!("connect {authority}: {e}")))?;

    let io = TokioIo::new(stream);
    let (sender, conn) = http1::handshake::<_, Empty<Bytes>>(io)
        .await
        .map_err(|e| ProbeError::Transient(format!("handshake {authority}: {e}")))?;

    // Drive the connection in the background.
    let authority = authority.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(%authority, error = %e, "connection ended");
        }
    });

    debug!(%peer, "connection opened");
    Ok(Connection { sender, peer })
}

fn parse_status(body: &[u8]) -> Result<ProbeOutcome, serde_json::Error> {
    let parsed: StatusBody = serde_json::from_slice(body)?;
    Ok(ProbeOutcome {
        authorized_count: parsed.authorized,
        unauthorized_count: parsed.unauthorized,
        ip: parsed.ip.filter(|ip| !ip.is_empty()),
    })
}

impl Probe for HttpProbe {
    type Context = HttpSession;

    fn open(&self) -> BoxFuture<'_, anyhow::Result<HttpSession>> {
        Box::pin(async { Ok(HttpSession::default()) })
    }

    fn probe<'a>(
        &'a self,
        ctx: &'a mut HttpSession,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<ProbeOutcome, ProbeError>> {
        Box::pin(self.run(ctx, target))
    }

    fn close(&self, ctx: HttpSession) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            debug!(connections = ctx.len(), "closing http session");
            // Dropping the senders ends each connection task.
            drop(ctx);
            Ok(())
        })
    }
}
