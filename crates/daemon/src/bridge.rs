// Shadowlink - Local Bridge
//
// Two loopback listeners feed application traffic into the upstream
// tunnel: a plain HTTP proxy endpoint and an HTTPS CONNECT endpoint.
// Every accepted connection runs in its own task, so a misbehaving
// client never stalls the rest. The bridge sees the tunnel only
// through a Weak handle; once the manager drops it, new requests are
// refused instead of relayed.

use std::sync::Weak;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use shadowlink_common::{Error, Result};

use crate::tunnel::TunnelHandle;

const MAX_HEAD: usize = 8 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Bridge {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Bind both loopback listeners and spawn their accept loops.
    pub async fn bind(http_port: u16, https_port: u16, tunnel: Weak<TunnelHandle>) -> Result<Self> {
        let http = bind_listener(http_port).await?;
        let https = bind_listener(https_port).await?;
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(accept_loop(
                http,
                ListenerKind::Http,
                tunnel.clone(),
                cancel.child_token(),
            )),
            tokio::spawn(accept_loop(
                https,
                ListenerKind::Connect,
                tunnel,
                cancel.child_token(),
            )),
        ];
        debug!(http_port, https_port, "bridge listeners bound");
        Ok(Self { cancel, tasks })
    }

    /// Stop accepting, cut in-flight relays, and wait for the accept
    /// loops to wind down.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let mut failure = None;
        for task in std::mem::take(&mut self.tasks) {
            match timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failure = Some(Error::Bridge(format!("bridge task failed: {err}"))),
                Err(_) => {
                    failure = Some(Error::Bridge("bridge tasks did not stop in time".into()))
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Clone, Copy)]
enum ListenerKind {
    Http,
    Connect,
}

async fn bind_listener(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                Error::PortInUse { port }
            } else {
                Error::Io(err)
            }
        })
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    tunnel: Weak<TunnelHandle>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "bridge accept failed");
                        continue;
                    }
                };
                let tunnel = tunnel.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    let result = match kind {
                        ListenerKind::Http => serve_http(stream, tunnel, cancel).await,
                        ListenerKind::Connect => serve_connect(stream, tunnel, cancel).await,
                    };
                    if let Err(err) = result {
                        debug!(%peer, %err, "bridge connection ended with error");
                    }
                });
            }
        }
    }
}

/// HTTPS endpoint: accept a CONNECT, open the upstream relay, then pipe
/// bytes both ways until either side closes or the bridge shuts down.
async fn serve_connect(
    mut client: TcpStream,
    tunnel: Weak<TunnelHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let (buf, head_end) = read_request_head(&mut client).await?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(&buf[..head_end]).is_err() {
        return refuse(&mut client, "400 Bad Request").await;
    }
    let (Some(method), Some(path)) = (request.method, request.path) else {
        return refuse(&mut client, "400 Bad Request").await;
    };
    if !method.eq_ignore_ascii_case("CONNECT") {
        return refuse(&mut client, "405 Method Not Allowed").await;
    }
    let Some((host, port)) = split_authority(path, 443) else {
        return refuse(&mut client, "400 Bad Request").await;
    };

    let Some(tunnel) = tunnel.upgrade() else {
        return refuse(&mut client, "503 Service Unavailable").await;
    };
    let mut upstream = match tunnel.open(host, port).await {
        Ok(upstream) => upstream,
        Err(err) => {
            debug!(%err, host, port, "upstream CONNECT failed");
            return refuse(&mut client, "502 Bad Gateway").await;
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    // Payload the client pipelined behind the CONNECT head goes out
    // before the relay takes over.
    if head_end < buf.len() {
        upstream.write_all(&buf[head_end..]).await?;
    }
    relay(client, upstream, cancel).await
}

/// HTTP endpoint: take a proxy-form request, rewrite it into origin
/// form, forward it upstream, and relay the rest of the exchange.
async fn serve_http(
    mut client: TcpStream,
    tunnel: Weak<TunnelHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    let (buf, head_end) = read_request_head(&mut client).await?;

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(&buf[..head_end]).is_err() {
        return refuse(&mut client, "400 Bad Request").await;
    }
    let (Some(method), Some(path)) = (request.method, request.path) else {
        return refuse(&mut client, "400 Bad Request").await;
    };
    if method.eq_ignore_ascii_case("CONNECT") {
        // CONNECT belongs on the HTTPS port.
        return refuse(&mut client, "405 Method Not Allowed").await;
    }

    let Some(target) = resolve_target(path, request.headers) else {
        return refuse(&mut client, "400 Bad Request").await;
    };

    let Some(tunnel) = tunnel.upgrade() else {
        return refuse(&mut client, "503 Service Unavailable").await;
    };
    let mut upstream = match tunnel.open(&target.host, target.port).await {
        Ok(upstream) => upstream,
        Err(err) => {
            debug!(%err, host = %target.host, port = target.port, "upstream connection failed");
            return refuse(&mut client, "502 Bad Gateway").await;
        }
    };

    // Rewrite to origin form, drop hop-by-hop headers, and force
    // connection close so EOF delimits the exchange.
    let mut head = format!("{} {} HTTP/1.1\r\n", method, target.origin_path);
    let mut saw_host = false;
    for header in request.headers.iter() {
        let name = header.name;
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("proxy-authorization")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(header.value));
        head.push_str("\r\n");
    }
    if !saw_host {
        head.push_str(&format!("Host: {}\r\n", target.authority));
    }
    head.push_str("Connection: close\r\n\r\n");

    upstream.write_all(head.as_bytes()).await?;
    // Body bytes that arrived together with the head go out first.
    if head_end < buf.len() {
        upstream.write_all(&buf[head_end..]).await?;
    }

    relay(client, upstream, cancel).await
}

async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("relay cut by bridge shutdown");
            Ok(())
        }
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
            let (to_upstream, to_client) = result?;
            debug!(to_upstream, to_client, "relay finished");
            Ok(())
        }
    }
}

/// Read until the end of the request head. Returns the buffer and the
/// offset one past the blank line; bytes beyond it belong to the body.
async fn read_request_head(stream: &mut TcpStream) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Bridge(
                "client closed before sending a full request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            return Ok((buf, pos));
        }
        if buf.len() > MAX_HEAD {
            return Err(Error::Bridge("request head exceeds 8 KiB".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn refuse(client: &mut TcpStream, status: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    client.write_all(response.as_bytes()).await?;
    Ok(())
}

struct Target {
    host: String,
    port: u16,
    authority: String,
    origin_path: String,
}

/// Derive the upstream target from an absolute-form request line, or
/// from the Host header when the client sent origin form.
fn resolve_target(path: &str, headers: &[httparse::Header<'_>]) -> Option<Target> {
    if let Some(rest) = path.strip_prefix("http://") {
        let (authority, origin_path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = split_authority(authority, 80)?;
        return Some(Target {
            host: host.to_string(),
            port,
            authority: authority.to_string(),
            origin_path: origin_path.to_string(),
        });
    }
    if path.starts_with('/') {
        let host_header = headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))?;
        let authority = std::str::from_utf8(host_header.value).ok()?.trim();
        let (host, port) = split_authority(authority, 80)?;
        return Some(Target {
            host: host.to_string(),
            port,
            authority: authority.to_string(),
            origin_path: path.to_string(),
        });
    }
    None
}

fn split_authority(authority: &str, default_port: u16) -> Option<(&str, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host, port.parse().ok()?))
        }
        // Bare host, or an unbracketed IPv6 literal.
        _ => Some((authority, default_port)),
    }
}
