//! WebSocket transport: wire frames, handshake and connection handles.
//!
//! Every connection starts with both sides sending a signed [`Hello`]. Once
//! the remote hello verifies, the write half is handed to a writer task fed by
//! a bounded queue and the read half is returned to the host, which runs the
//! read loop.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, trace};

use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId, verify_signature};

/// Capacity of each connection's outbound frame queue.
const OUTBOUND_QUEUE: usize = 256;

/// Read half of an established WebSocket connection.
pub type FrameStream<T> = SplitStream<WebSocketStream<T>>;

/// Handshake message proving control of the key a peer id derives from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// Address the sender accepts connections on.
    pub listen_addr: String,
    /// Unix seconds when the hello was signed.
    pub timestamp: i64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Hello {
    /// Build and sign a hello for `identity`.
    pub fn signed(identity: &NodeIdentity, listen_addr: impl Into<String>) -> Self {
        let listen_addr = listen_addr.into();
        let timestamp = chrono::Utc::now().timestamp();
        let payload = Self::signing_payload(&identity.peer_id, &listen_addr, timestamp);
        Self {
            peer_id: identity.peer_id.clone(),
            public_key: identity.keypair().public_key().to_vec(),
            listen_addr,
            timestamp,
            signature: identity.keypair().sign(&payload).to_vec(),
        }
    }

    fn signing_payload(peer_id: &PeerId, listen_addr: &str, timestamp: i64) -> Vec<u8> {
        format!("pomo-hello|{peer_id}|{listen_addr}|{timestamp}").into_bytes()
    }

    /// Check the peer id matches the key and the signature is valid.
    pub fn verify(&self) -> Result<(), NetworkError> {
        let derived = PeerId::from_public_key(&self.public_key);
        if derived != self.peer_id {
            return Err(NetworkError::Handshake(format!(
                "peer id {} does not match its public key",
                self.peer_id
            )));
        }
        let payload = Self::signing_payload(&self.peer_id, &self.listen_addr, self.timestamp);
        verify_signature(&self.public_key, &payload, &self.signature)
    }
}

/// A message published to a topic, as carried between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// Unique id used to suppress duplicates while gossiping.
    pub id: String,
    pub topic: String,
    /// The peer that originally published the message.
    pub origin: PeerId,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// A single frame on a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    /// The sender wants publications for `topic`.
    Subscribe { topic: String },
    /// The sender no longer wants publications for `topic`.
    Unsubscribe { topic: String },
    Publish(Publication),
    /// Clean disconnect notification.
    Goodbye,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Publish(_) => "publish",
            Self::Goodbye => "goodbye",
        }
    }
}

/// A handle to an active connection with a verified peer.
///
/// Cloning the handle is cheap; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    conn_id: String,
    peer_id: PeerId,
    remote_addr: SocketAddr,
    dialer: PeerId,
    outbound: mpsc::Sender<Frame>,
    topics: Arc<RwLock<HashSet<String>>>,
}

impl PeerConnection {
    /// Locally unique id of this connection.
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// The verified peer on the other end.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The peer that initiated the connection.
    pub fn dialer(&self) -> &PeerId {
        &self.dialer
    }

    /// Queue a frame for sending. Fails if the queue is full or the
    /// connection is gone.
    pub fn send(&self, frame: Frame) -> Result<(), NetworkError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(frame) => NetworkError::Transport(format!(
                "outbound queue to {} full, dropped {}",
                self.peer_id,
                frame.name()
            )),
            TrySendError::Closed(_) => {
                NetworkError::Transport(format!("connection to {} closed", self.peer_id))
            }
        })
    }

    /// Whether the peer asked for publications on `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    pub(crate) fn set_subscribed(&self, topic: String, subscribed: bool) {
        let mut topics = self.topics.write();
        if subscribed {
            topics.insert(topic);
        } else {
            topics.remove(&topic);
        }
    }

    /// Ask the writer to say goodbye and close the socket.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Frame::Goodbye);
    }
}

/// Spawn the task that drains `rx` into the socket's write half.
fn spawn_writer<S>(mut sink: S, mut rx: mpsc::Receiver<Frame>, peer_id: PeerId)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Frame::Goodbye);
            let json = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    debug!("Dropping unserializable {} frame: {e}", frame.name());
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                debug!("Write to {peer_id} failed: {e}");
                break;
            }
            if closing {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
        let _ = sink.close().await;
        trace!("Writer for {peer_id} finished");
    });
}

/// Exchange hellos on a fresh socket and wrap it into a [`PeerConnection`].
async fn handshake<T>(
    ws: WebSocketStream<T>,
    local: Hello,
    remote_addr: SocketAddr,
    dialed_by_us: bool,
) -> Result<(PeerConnection, Hello, FrameStream<T>), NetworkError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let local_id = local.peer_id.clone();
    let (mut sink, mut stream) = ws.split();

    let json = Frame::Hello(local).to_json()?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| NetworkError::Transport(format!("Send hello to {remote_addr}: {e}")))?;

    let remote = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match Frame::from_json(&text)? {
                Frame::Hello(hello) => break hello,
                other => {
                    return Err(NetworkError::Handshake(format!(
                        "expected hello from {remote_addr}, got {}",
                        other.name()
                    )));
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) | None => {
                return Err(NetworkError::Handshake(format!(
                    "{remote_addr} closed during handshake"
                )));
            }
            Some(Err(e)) => {
                return Err(NetworkError::Transport(format!(
                    "Read hello from {remote_addr}: {e}"
                )));
            }
        }
    };

    remote.verify()?;
    if remote.peer_id == local_id {
        return Err(NetworkError::Handshake("refusing connection to self".to_string()));
    }

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    spawn_writer(sink, rx, remote.peer_id.clone());

    let dialer = if dialed_by_us {
        local_id
    } else {
        remote.peer_id.clone()
    };
    let connection = PeerConnection {
        conn_id: uuid::Uuid::new_v4().to_string(),
        peer_id: remote.peer_id.clone(),
        remote_addr,
        dialer,
        outbound: tx,
        topics: Arc::new(RwLock::new(HashSet::new())),
    };
    Ok((connection, remote, stream))
}

/// Complete the server side of a connection accepted on the listener.
pub async fn accept_peer(
    stream: TcpStream,
    remote_addr: SocketAddr,
    local: Hello,
) -> Result<(PeerConnection, Hello, FrameStream<TcpStream>), NetworkError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| NetworkError::Transport(format!("WebSocket accept from {remote_addr}: {e}")))?;
    handshake(ws, local, remote_addr, false).await
}

/// Connect to a remote peer as a client and run the handshake.
pub async fn connect_to_peer(
    addr: &str,
    local: Hello,
) -> Result<
    (
        PeerConnection,
        Hello,
        FrameStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ),
    NetworkError,
> {
    let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    };

    let (ws, _) = connect_async(&url)
        .await
        .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;

    let remote_addr: SocketAddr = addr
        .trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

    handshake(ws, local, remote_addr, true).await
}

// ---------------------------------------------------------------------------
// Serde helper for byte payloads
// ---------------------------------------------------------------------------

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_hello_verifies() {
        let identity = NodeIdentity::generate("node");
        let hello = Hello::signed(&identity, "127.0.0.1:4000");
        assert!(hello.verify().is_ok());
    }

    #[test]
    fn test_hello_with_foreign_peer_id_fails() {
        let identity = NodeIdentity::generate("node");
        let mut hello = Hello::signed(&identity, "127.0.0.1:4000");
        hello.peer_id = PeerId::from_string("impostor");
        assert!(matches!(hello.verify(), Err(NetworkError::Handshake(_))));
    }

    #[test]
    fn test_hello_with_altered_address_fails() {
        let identity = NodeIdentity::generate("node");
        let mut hello = Hello::signed(&identity, "127.0.0.1:4000");
        hello.listen_addr = "10.0.0.9:4000".to_string();
        assert!(hello.verify().is_err());
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::Publish(Publication {
            id: "m1".to_string(),
            topic: "pomo-room-x".to_string(),
            origin: PeerId::from_string("peer-a"),
            data: vec![0xde, 0xad],
        });
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "publish");
        assert_eq!(json["data"], "dead");

        let parsed = Frame::from_json(&frame.to_json().unwrap()).unwrap();
        match parsed {
            Frame::Publish(publication) => assert_eq!(publication.data, vec![0xde, 0xad]),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_bad_hex_payload_is_rejected() {
        let raw = r#"{"kind":"publish","id":"m","topic":"t","origin":"p","data":"zz"}"#;
        assert!(Frame::from_json(raw).is_err());
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server_identity = NodeIdentity::generate("server");
        let server_hello = Hello::signed(&server_identity, server_addr.to_string());
        let server_id = server_identity.peer_id.clone();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            accept_peer(stream, remote, server_hello).await
        });

        let client_identity = NodeIdentity::generate("client");
        let client_hello = Hello::signed(&client_identity, "127.0.0.1:0");
        let (client_conn, remote_hello, _stream) =
            connect_to_peer(&server_addr.to_string(), client_hello)
                .await
                .unwrap();

        assert_eq!(remote_hello.peer_id, server_id);
        assert_eq!(client_conn.peer_id(), &server_id);
        assert_eq!(client_conn.dialer(), &client_identity.peer_id);

        let (server_conn, _, _server_stream) = server.await.unwrap().unwrap();
        assert_eq!(server_conn.peer_id(), &client_identity.peer_id);
        assert_eq!(server_conn.dialer(), &client_identity.peer_id);

        client_conn.close();
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let identity = NodeIdentity::generate("client");
        let result = connect_to_peer(&addr.to_string(), Hello::signed(&identity, "x")).await;
        assert!(matches!(result, Err(NetworkError::Transport(_))));
    }
}
