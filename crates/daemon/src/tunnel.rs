// Shadowlink - Upstream Tunnel
//
// Connectors speak the remote proxy's dialect: SOCKS5 for ss/ssr
// profiles, HTTP CONNECT for http profiles. The manager owns the
// TunnelHandle wrapping the active connector; the bridge only holds a
// Weak reference, so a torn-down tunnel refuses new relays immediately.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use shadowlink_common::{format_host_port, Error, ProxyKind, ProxyProfile, Result};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const SUBNEG_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// One upstream proxy protocol.
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    /// Handshake with the remote proxy without opening a relay; used to
    /// validate a profile before the local bridge goes live.
    async fn verify(&self) -> Result<()>;

    /// Open a relay stream to `host:port` through the remote proxy.
    /// The returned stream is past all handshakes and carries payload
    /// bytes only.
    async fn open(&self, host: &str, port: u16) -> Result<TcpStream>;
}

/// Pick the connector matching the profile kind.
pub fn connector_for(profile: &ProxyProfile) -> Arc<dyn ProxyConnector> {
    match profile.kind {
        ProxyKind::Ss | ProxyKind::Ssr => Arc::new(Socks5Connector::from_profile(profile)),
        ProxyKind::Http => Arc::new(HttpConnectConnector::from_profile(profile)),
    }
}

/// The live upstream of the current connection.
pub struct TunnelHandle {
    connector: Arc<dyn ProxyConnector>,
}

impl TunnelHandle {
    pub fn new(connector: Arc<dyn ProxyConnector>) -> Self {
        Self { connector }
    }

    pub async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        self.connector.open(host, port).await
    }
}

/// SOCKS5 client, RFC 1928 with RFC 1929 username/password auth.
///
/// The stored secret rides in the password field with an empty
/// username; an empty secret negotiates the no-auth method instead.
pub struct Socks5Connector {
    server_host: String,
    server_port: u16,
    password: String,
    timeout: Duration,
}

impl Socks5Connector {
    pub fn new(server_host: String, server_port: u16, password: String, timeout: Duration) -> Self {
        Self {
            server_host,
            server_port,
            password,
            timeout,
        }
    }

    pub fn from_profile(profile: &ProxyProfile) -> Self {
        Self::new(
            profile.server_host.clone(),
            profile.server_port,
            profile.password.clone(),
            profile.timeout_duration(),
        )
    }

    async fn handshake(&self) -> Result<TcpStream> {
        let mut stream = connect_proxy(&self.server_host, self.server_port).await?;
        self.negotiate(&mut stream).await?;
        Ok(stream)
    }

    async fn negotiate(&self, stream: &mut TcpStream) -> Result<()> {
        let methods: &[u8] = if self.password.is_empty() {
            &[AUTH_NONE]
        } else {
            &[AUTH_NONE, AUTH_USERNAME_PASSWORD]
        };
        let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION {
            return Err(Error::Connect(format!(
                "proxy answered with SOCKS version {}",
                reply[0]
            )));
        }
        match reply[1] {
            AUTH_NONE => Ok(()),
            AUTH_USERNAME_PASSWORD => self.authenticate(stream).await,
            AUTH_NO_ACCEPTABLE => Err(Error::Auth(
                "proxy accepts none of the offered auth methods".into(),
            )),
            other => Err(Error::Auth(format!(
                "proxy selected unsupported auth method {other:#04x}"
            ))),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        if self.password.len() > 255 {
            return Err(Error::Config("proxy password exceeds 255 bytes".into()));
        }
        let mut request = vec![SUBNEG_VERSION, 0, self.password.len() as u8];
        request.extend_from_slice(self.password.as_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0 {
            return Err(Error::Auth("proxy rejected the credentials".into()));
        }
        Ok(())
    }

    async fn send_connect(&self, stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(Error::Config(format!(
                        "target host {host:?} exceeds 255 bytes"
                    )));
                }
                request.push(ATYP_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;
        Ok(())
    }

    async fn read_connect_reply(&self, stream: &mut TcpStream) -> Result<()> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Connect(format!(
                "proxy answered with SOCKS version {}",
                header[0]
            )));
        }
        if header[1] != REP_SUCCESS {
            return Err(Error::Connect(format!(
                "proxy refused the relay: {}",
                reply_message(header[1])
            )));
        }
        // Drain the bound address so the stream starts at payload bytes.
        let remaining = match header[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            other => {
                return Err(Error::Connect(format!(
                    "proxy answered with unknown address type {other:#04x}"
                )))
            }
        };
        let mut bound = vec![0u8; remaining];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyConnector for Socks5Connector {
    async fn verify(&self) -> Result<()> {
        timeout(self.timeout, async {
            let _stream = self.handshake().await?;
            Ok(())
        })
        .await
        .map_err(|_| timeout_error(&self.server_host, self.server_port, self.timeout))?
    }

    async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        timeout(self.timeout, async {
            let mut stream = self.handshake().await?;
            self.send_connect(&mut stream, host, port).await?;
            self.read_connect_reply(&mut stream).await?;
            Ok(stream)
        })
        .await
        .map_err(|_| timeout_error(&self.server_host, self.server_port, self.timeout))?
    }
}

/// HTTP CONNECT client for http-kind profiles.
///
/// When the profile carries a secret it is sent verbatim as the Basic
/// `user:password` credential pair.
pub struct HttpConnectConnector {
    server_host: String,
    server_port: u16,
    credentials: Option<String>,
    timeout: Duration,
}

impl HttpConnectConnector {
    pub fn new(
        server_host: String,
        server_port: u16,
        credentials: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_host,
            server_port,
            credentials,
            timeout,
        }
    }

    pub fn from_profile(profile: &ProxyProfile) -> Self {
        let credentials = if profile.password.is_empty() {
            None
        } else {
            Some(profile.password.clone())
        };
        Self::new(
            profile.server_host.clone(),
            profile.server_port,
            credentials,
            profile.timeout_duration(),
        )
    }
}

#[async_trait]
impl ProxyConnector for HttpConnectConnector {
    async fn verify(&self) -> Result<()> {
        // An HTTP proxy has no handshake before the first request, so
        // verification is reachability only.
        timeout(
            self.timeout,
            connect_proxy(&self.server_host, self.server_port),
        )
        .await
        .map_err(|_| timeout_error(&self.server_host, self.server_port, self.timeout))?
        .map(|_| ())
    }

    async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        timeout(self.timeout, async {
            let mut stream = connect_proxy(&self.server_host, self.server_port).await?;
            let authority = format_host_port(host, port);
            let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
            if let Some(credentials) = &self.credentials {
                request.push_str(&format!(
                    "Proxy-Authorization: Basic {}\r\n",
                    BASE64_STANDARD.encode(credentials)
                ));
            }
            request.push_str("\r\n");
            stream.write_all(request.as_bytes()).await?;

            match read_connect_status(&mut stream).await? {
                200..=299 => Ok(stream),
                407 => Err(Error::Auth("proxy requires different credentials".into())),
                code => Err(Error::Connect(format!(
                    "proxy refused CONNECT with status {code}"
                ))),
            }
        })
        .await
        .map_err(|_| timeout_error(&self.server_host, self.server_port, self.timeout))?
    }
}

async fn connect_proxy(host: &str, port: u16) -> Result<TcpStream> {
    TcpStream::connect((host, port)).await.map_err(|err| {
        Error::Connect(format!(
            "failed to reach proxy server {}: {err}",
            format_host_port(host, port)
        ))
    })
}

/// Read the CONNECT response head byte-wise so no relay bytes past the
/// blank line are consumed, then return the status code.
async fn read_connect_status(stream: &mut TcpStream) -> Result<u16> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(Error::Connect("CONNECT response head exceeds 8 KiB".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Connect(
                "proxy closed the connection during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&head)
        .map_err(|err| Error::Connect(format!("malformed CONNECT response: {err}")))?;
    response
        .code
        .ok_or_else(|| Error::Connect("CONNECT response carries no status code".into()))
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

fn timeout_error(host: &str, port: u16, timeout: Duration) -> Error {
    Error::Timeout(format!(
        "proxy {} did not answer within {timeout:?}",
        format_host_port(host, port)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn socks5_open_without_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, 0x01, 0x00, 0x03]);
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut target = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut target).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut payload = [0u8; 4];
            stream.read_exact(&mut payload).await.unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            String::new(),
            Duration::from_secs(2),
        );
        let mut stream = connector.open("target.example.com", 443).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn socks5_password_subnegotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            stream.write_all(&[0x05, 0x02]).await.unwrap();

            // RFC 1929: version, empty username, then the secret
            let mut prefix = [0u8; 2];
            stream.read_exact(&mut prefix).await.unwrap();
            assert_eq!(prefix, [0x01, 0x00]);
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut password = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut password).await.unwrap();
            assert_eq!(password, b"s3cret");
            stream.write_all(&[0x01, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut target = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut target).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            "s3cret".into(),
            Duration::from_secs(2),
        );
        assert!(connector.open("example.com", 80).await.is_ok());
    }

    #[tokio::test]
    async fn socks5_rejected_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x02]).await.unwrap();
            let mut prefix = [0u8; 3];
            stream.read_exact(&mut prefix).await.unwrap();
            let mut password = vec![0u8; prefix[2] as usize];
            stream.read_exact(&mut password).await.unwrap();
            stream.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            "wrong".into(),
            Duration::from_secs(2),
        );
        let err = connector.open("example.com", 80).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn socks5_no_acceptable_method() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            String::new(),
            Duration::from_secs(2),
        );
        let err = connector.verify().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn socks5_relay_refused_by_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut target = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut target).await.unwrap();
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            String::new(),
            Duration::from_secs(2),
        );
        let err = connector.open("example.com", 80).await.unwrap_err();
        match err {
            Error::Connect(message) => assert!(message.contains("connection refused")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let connector = Socks5Connector::new(
            "127.0.0.1".into(),
            port,
            String::new(),
            Duration::from_millis(200),
        );
        let err = connector.verify().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn http_connect_established() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            assert!(head.starts_with("CONNECT target.example.com:443 HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut payload = [0u8; 4];
            stream.read_exact(&mut payload).await.unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let connector =
            HttpConnectConnector::new("127.0.0.1".into(), port, None, Duration::from_secs(2));
        let mut stream = connector.open("target.example.com", 443).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn http_connect_sends_basic_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            // base64("user:pw")
            assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        let connector = HttpConnectConnector::new(
            "127.0.0.1".into(),
            port,
            Some("user:pw".into()),
            Duration::from_secs(2),
        );
        assert!(connector.open("example.com", 443).await.is_ok());
    }

    #[tokio::test]
    async fn http_connect_auth_required() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _head = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let connector =
            HttpConnectConnector::new("127.0.0.1".into(), port, None, Duration::from_secs(2));
        let err = connector.open("example.com", 443).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn connector_selection_follows_profile_kind() {
        let mut profile = ProxyProfile {
            id: None,
            remark: String::new(),
            server_host: "example.com".into(),
            server_port: 8388,
            password: "pw".into(),
            encrypt_method: "aes-256-gcm".into(),
            protocol: None,
            protocol_param: None,
            obfs: None,
            obfs_param: None,
            kind: ProxyKind::Ss,
            timeout: 60,
            plugin: None,
        };
        // Selection itself is infallible for every kind.
        let _ss = connector_for(&profile);
        profile.kind = ProxyKind::Http;
        let _http = connector_for(&profile);
    }
}
