// Cellular forwarding. `CellularSession` is the seam the relay talks to;
// `CloudSocket` is the real implementation, speaking the cloud socket's
// one-shot JSON exchange over TCP. `with_link` owns the link lifecycle so an
// explicitly opened link is always closed again.
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CellularConfig;
use crate::error::RelayError;

/// Replies are a short JSON array; anything past this is not read.
const MAX_REPLY_BYTES: u64 = 4096;

#[derive(Debug, Error)]
pub enum CellularError {
    #[error("cellular link is closed")]
    SessionClosed,

    #[error("could not resolve cloud endpoint {0}")]
    Unresolved(String),

    #[error("cloud socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cloud message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unexpected cloud response: {0:?}")]
    BadResponse(String),
}

/// Result codes reported by the cloud socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    ConnectionClosed,
    MessageInvalid,
    AuthInvalid,
    PayloadInvalid,
    ProtocolInvalid,
    Internal,
    Unknown(i64),
}

impl ResultCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::ConnectionClosed,
            2 => ResultCode::MessageInvalid,
            3 => ResultCode::AuthInvalid,
            4 => ResultCode::PayloadInvalid,
            5 => ResultCode::ProtocolInvalid,
            6 => ResultCode::Internal,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::ConnectionClosed => 1,
            ResultCode::MessageInvalid => 2,
            ResultCode::AuthInvalid => 3,
            ResultCode::PayloadInvalid => 4,
            ResultCode::ProtocolInvalid => 5,
            ResultCode::Internal => 6,
            ResultCode::Unknown(c) => *c,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::Ok => "Message sent successfully",
            ResultCode::ConnectionClosed => {
                "Connection was closed so we couldn't read the whole message"
            }
            ResultCode::MessageInvalid => "Failed to parse the message",
            ResultCode::AuthInvalid => "Auth section of the message was invalid",
            ResultCode::PayloadInvalid => "Payload type was invalid",
            ResultCode::ProtocolInvalid => "Protocol type was invalid",
            ResultCode::Internal => "An internal error occurred",
            ResultCode::Unknown(_) => "Unknown error",
        }
    }
}

/// What the cloud answered for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudResponse {
    pub code: ResultCode,
    pub raw: String,
}

impl CloudResponse {
    /// Parse a response body such as `[0,0]`. The first element is the result code.
    pub fn parse(body: &str) -> Result<Self, CellularError> {
        let raw = body.trim().to_string();
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&raw).map_err(|_| CellularError::BadResponse(raw.clone()))?;
        let code = values
            .first()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| CellularError::BadResponse(raw.clone()))?;
        Ok(Self {
            code: ResultCode::from_code(code),
            raw,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

impl fmt::Display for CloudResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.code.code(), self.code.description(), self.raw)
    }
}

#[async_trait]
pub trait CellularSession: Send + Sync {
    /// Bring the link up.
    async fn connect(&self) -> Result<(), CellularError>;

    /// Send one message tagged with `topics` and return the service's answer.
    async fn send_message(
        &self,
        message: &str,
        topics: &[String],
    ) -> Result<CloudResponse, CellularError>;

    /// Take the link down. Further sends fail with `SessionClosed`.
    async fn disconnect(&self) -> Result<(), CellularError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Never connected explicitly; every send resolves the endpoint itself.
    Implicit,
    Up(SocketAddr),
    Closed,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "k", skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(rename = "d")]
    data: &'a str,
    #[serde(rename = "t")]
    topics: &'a [String],
}

pub struct CloudSocket {
    config: CellularConfig,
    link: Mutex<Link>,
}

impl CloudSocket {
    pub fn new(config: CellularConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link::Implicit),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.cloud_host, self.config.cloud_port)
    }

    async fn resolve(&self) -> Result<SocketAddr, CellularError> {
        let host = (self.config.cloud_host.as_str(), self.config.cloud_port);
        let mut addrs = lookup_host(host).await?;
        addrs.next().ok_or_else(|| CellularError::Unresolved(self.endpoint()))
    }

    fn encode(&self, message: &str, topics: &[String]) -> Result<Vec<u8>, CellularError> {
        let envelope = Envelope {
            key: self.config.device_key.as_deref(),
            data: message,
            topics,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}

#[async_trait]
impl CellularSession for CloudSocket {
    async fn connect(&self) -> Result<(), CellularError> {
        let addr = self.resolve().await?;
        *self.link.lock().await = Link::Up(addr);
        info!(endpoint = %self.endpoint(), %addr, "cellular link up");
        Ok(())
    }

    async fn send_message(
        &self,
        message: &str,
        topics: &[String],
    ) -> Result<CloudResponse, CellularError> {
        let link = *self.link.lock().await;
        let addr = match link {
            Link::Up(addr) => addr,
            Link::Implicit => self.resolve().await?,
            Link::Closed => return Err(CellularError::SessionClosed),
        };

        let body = self.encode(message, topics)?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&body).await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        (&mut stream).take(MAX_REPLY_BYTES).read_to_end(&mut reply).await?;
        let response = CloudResponse::parse(&String::from_utf8_lossy(&reply))?;
        debug!(%addr, bytes = body.len(), code = response.code.code(), "cloud message exchanged");
        Ok(response)
    }

    async fn disconnect(&self) -> Result<(), CellularError> {
        *self.link.lock().await = Link::Closed;
        info!(endpoint = %self.endpoint(), "cellular link down");
        Ok(())
    }
}

/// Run `body` with the cellular link held. With `manage_link` the session is
/// connected first and disconnected exactly once afterwards, whatever `body`
/// returned. Without it the session is handed over untouched.
pub async fn with_link<T, F, Fut>(
    session: Arc<dyn CellularSession>,
    manage_link: bool,
    body: F,
) -> Result<T, RelayError>
where
    F: FnOnce(Arc<dyn CellularSession>) -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    if !manage_link {
        return body(session).await;
    }

    session.connect().await?;
    let outcome = body(session.clone()).await;
    let released = session.disconnect().await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(error = %release_err, "cellular link release failed after relay error");
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Records every call and answers with a canned response.
    #[derive(Default)]
    pub(crate) struct MockSession {
        pub connects: AtomicUsize,
        pub disconnects: AtomicUsize,
        pub sent: std::sync::Mutex<Vec<(String, Vec<String>)>>,
        pub fail_send: bool,
        pub hang_send: bool,
    }

    impl MockSession {
        pub fn failing() -> Self {
            Self {
                fail_send: true,
                ..Default::default()
            }
        }

        /// A session whose sends never complete, like a stalled modem.
        pub fn hanging() -> Self {
            Self {
                hang_send: true,
                ..Default::default()
            }
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<(String, Vec<String>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CellularSession for MockSession {
        async fn connect(&self) -> Result<(), CellularError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(
            &self,
            message: &str,
            topics: &[String],
        ) -> Result<CloudResponse, CellularError> {
            if self.hang_send {
                std::future::pending::<()>().await;
            }
            if self.fail_send {
                return Err(CellularError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "modem went away",
                )));
            }
            self.sent.lock().unwrap().push((message.to_string(), topics.to_vec()));
            Ok(CloudResponse {
                code: ResultCode::Ok,
                raw: format!("[0,\"{message}\"]"),
            })
        }

        async fn disconnect(&self) -> Result<(), CellularError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// One-connection fake of the cloud socket: returns what it read and
    /// answers with `reply`.
    async fn fake_cloud(reply: impl Into<String>) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let reply = reply.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            // The client may hang up before an oversized reply is written.
            let _ = sock.write_all(reply.as_bytes()).await;
            String::from_utf8(buf).unwrap()
        });
        (addr, handle)
    }

    fn socket_for(addr: SocketAddr, device_key: Option<&str>) -> CloudSocket {
        CloudSocket::new(CellularConfig {
            cloud_host: addr.ip().to_string(),
            cloud_port: addr.port(),
            device_key: device_key.map(str::to_string),
            manage_link: true,
        })
    }

    #[test]
    fn parses_responses() {
        let ok = CloudResponse::parse("[0,0]\n").unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.raw, "[0,0]");
        assert_eq!(ok.to_string(), "0 Message sent successfully ([0,0])");

        let auth = CloudResponse::parse("[3,0]").unwrap();
        assert_eq!(auth.code, ResultCode::AuthInvalid);
        assert_eq!(CloudResponse::parse("[42]").unwrap().code, ResultCode::Unknown(42));

        assert!(matches!(CloudResponse::parse("garbage"), Err(CellularError::BadResponse(_))));
        assert!(matches!(CloudResponse::parse("[]"), Err(CellularError::BadResponse(_))));
    }

    #[tokio::test]
    async fn sends_envelope_with_topic() {
        let (addr, cloud) = fake_cloud("[0,0]").await;
        let socket = socket_for(addr, Some("k3y"));
        socket.connect().await.unwrap();

        let response = socket.send_message("42", &["node/value".to_string()]).await.unwrap();
        assert!(response.is_ok());

        let sent: serde_json::Value = serde_json::from_str(&cloud.await.unwrap()).unwrap();
        assert_eq!(sent["k"], "k3y");
        assert_eq!(sent["d"], "42");
        assert_eq!(sent["t"], serde_json::json!(["node/value"]));
    }

    #[tokio::test]
    async fn implicit_link_omits_missing_key() {
        let (addr, cloud) = fake_cloud("[4,0]").await;
        let socket = socket_for(addr, None);

        let response = socket.send_message("hello", &["node/value".to_string()]).await.unwrap();
        assert_eq!(response.code, ResultCode::PayloadInvalid);

        let sent: serde_json::Value = serde_json::from_str(&cloud.await.unwrap()).unwrap();
        assert!(sent.get("k").is_none());
        assert_eq!(sent["d"], "hello");
    }

    #[tokio::test]
    async fn oversized_reply_is_cut_off() {
        let padding = "x".repeat(MAX_REPLY_BYTES as usize * 2);
        let (addr, cloud) = fake_cloud(format!("[0,\"{padding}\"]")).await;
        let socket = socket_for(addr, None);

        let err = socket.send_message("42", &["node/value".to_string()]).await.unwrap_err();
        match err {
            CellularError::BadResponse(raw) => assert_eq!(raw.len(), MAX_REPLY_BYTES as usize),
            other => panic!("expected BadResponse, got {other:?}"),
        }
        cloud.await.unwrap();
    }

    #[tokio::test]
    async fn closed_link_refuses_to_send() {
        let socket = socket_for("127.0.0.1:9".parse().unwrap(), None);
        socket.disconnect().await.unwrap();
        let err = socket.send_message("42", &[]).await.unwrap_err();
        assert!(matches!(err, CellularError::SessionClosed));
    }

    #[tokio::test]
    async fn managed_link_is_released_after_error() {
        let mock = Arc::new(MockSession::default());
        let session: Arc<dyn CellularSession> = mock.clone();

        let result: Result<(), RelayError> =
            with_link(session, true, |_| async { Err(RelayError::EventStreamClosed) }).await;

        assert!(matches!(result, Err(RelayError::EventStreamClosed)));
        assert_eq!(mock.connects(), 1);
        assert_eq!(mock.disconnects(), 1);
    }

    #[tokio::test]
    async fn unmanaged_link_is_left_alone() {
        let mock = Arc::new(MockSession::default());
        let session: Arc<dyn CellularSession> = mock.clone();

        let value = with_link(session, false, |_| async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(mock.connects(), 0);
        assert_eq!(mock.disconnects(), 0);
    }
}
