//! Host: the node's network endpoint.
//!
//! [`Host`] owns the listening socket, the set of verified peer connections
//! and the gossip state behind [`Topic`]s:
//! - publications go to peers that subscribed to the topic,
//! - every publication is delivered to local subscribers, own ones included,
//! - a publication received from a peer is re-forwarded once to the other
//!   interested peers, with duplicates suppressed by id.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId};
use crate::pubsub::{InboundMessage, SeenCache, Subscription, SubscriptionTable, Topic};
use crate::shutdown::Shutdown;
use crate::transport::{self, Frame, FrameStream, Hello, PeerConnection, Publication};

/// Number of publication ids remembered for duplicate suppression.
const SEEN_CACHE_SIZE: usize = 4096;

/// A network endpoint with authenticated peer connections and topic pub/sub.
pub struct Host {
    identity: Arc<NodeIdentity>,
    listen_addr: SocketAddr,
    connection_timeout: Duration,
    connections: RwLock<HashMap<PeerId, PeerConnection>>,
    joined_topics: Mutex<HashSet<String>>,
    subscriptions: Mutex<SubscriptionTable>,
    seen: Mutex<SeenCache>,
    shutdown: Shutdown,
}

impl Host {
    /// Bind the listener and start accepting peer connections.
    pub async fn bind(
        identity: Arc<NodeIdentity>,
        listen_addr: SocketAddr,
        connection_timeout: Duration,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, NetworkError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound_addr = listener.local_addr()?;
        info!(
            "Host {} listening on {bound_addr}",
            identity.peer_id
        );

        let host = Arc::new(Self {
            identity,
            listen_addr: bound_addr,
            connection_timeout,
            connections: RwLock::new(HashMap::new()),
            joined_topics: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            seen: Mutex::new(SeenCache::new(SEEN_CACHE_SIZE)),
            shutdown,
        });

        tokio::spawn(Arc::clone(&host).accept_loop(listener));
        Ok(host)
    }

    /// This node's peer ID.
    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The address the listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    /// Whether a live connection to `peer_id` exists.
    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    /// IDs of all connected peers.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().cloned().collect()
    }

    fn local_hello(&self) -> Hello {
        Hello::signed(&self.identity, self.listen_addr.to_string())
    }

    /// Dial `addr` and return the verified peer ID on the other end.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<PeerId, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }

        let (connection, remote, stream) = tokio::time::timeout(
            self.connection_timeout,
            transport::connect_to_peer(addr, self.local_hello()),
        )
        .await
        .map_err(|_| NetworkError::Timeout(self.connection_timeout))??;

        debug!("Handshake with {} at {addr} complete", remote.peer_id);
        self.register(connection, stream);
        Ok(remote.peer_id)
    }

    /// Make sure a connection to `peer_id` exists, trying each address in
    /// turn. Succeeds immediately if already connected.
    pub async fn connect_peer(
        self: &Arc<Self>,
        peer_id: &PeerId,
        addresses: &[String],
    ) -> Result<(), NetworkError> {
        if self.is_connected(peer_id) {
            return Ok(());
        }

        let mut last_error = NetworkError::PeerNotFound(format!("{peer_id} has no addresses"));
        for addr in addresses {
            match self.connect(addr).await {
                Ok(remote) if &remote == peer_id => return Ok(()),
                Ok(remote) => {
                    last_error = NetworkError::Handshake(format!(
                        "expected {peer_id} at {addr}, found {remote}"
                    ));
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Close the connection to `peer_id`, if any.
    pub fn disconnect(&self, peer_id: &PeerId) -> bool {
        match self.connections.write().remove(peer_id) {
            Some(connection) => {
                connection.close();
                info!("Disconnected from {peer_id}");
                true
            }
            None => false,
        }
    }

    /// Open a handle on `name`. Only one handle per topic may be open.
    pub fn join_topic(self: &Arc<Self>, name: &str) -> Result<Topic, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        if !self.joined_topics.lock().insert(name.to_string()) {
            return Err(NetworkError::TopicAlreadyJoined(name.to_string()));
        }
        debug!("Joined topic {name}");
        Ok(Topic::new(name.to_string(), Arc::clone(self)))
    }

    pub(crate) fn release_topic(&self, name: &str) {
        self.joined_topics.lock().remove(name);
        debug!("Released topic {name}");
    }

    pub(crate) fn add_subscription(self: &Arc<Self>, topic: &str) -> Subscription {
        let (id, rx, first) = self.subscriptions.lock().add(topic);
        if first {
            self.announce_interest(topic, true);
        }
        Subscription::new(topic.to_string(), id, rx, Arc::clone(self))
    }

    pub(crate) fn remove_subscription(&self, topic: &str, id: u64) {
        let last = self.subscriptions.lock().remove(topic, id);
        if last {
            self.announce_interest(topic, false);
        }
    }

    fn announce_interest(&self, topic: &str, subscribed: bool) {
        let connections: Vec<PeerConnection> = self.connections.read().values().cloned().collect();
        for connection in connections {
            let frame = if subscribed {
                Frame::Subscribe {
                    topic: topic.to_string(),
                }
            } else {
                Frame::Unsubscribe {
                    topic: topic.to_string(),
                }
            };
            if let Err(e) = connection.send(frame) {
                debug!("Interest update for {topic} not sent: {e}");
            }
        }
    }

    /// Publish `data` on `topic`. Returns the number of peers it was sent to.
    pub(crate) fn publish(&self, topic: &str, data: Vec<u8>) -> Result<usize, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }

        let publication = Publication {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            origin: self.peer_id().clone(),
            data,
        };
        self.seen.lock().insert(&publication.id);

        self.deliver_local(&publication, self.peer_id());
        let sent = self.forward(&publication, None);
        trace!("Published {} on {topic} to {sent} peers", publication.id);
        Ok(sent)
    }

    fn deliver_local(&self, publication: &Publication, received_from: &PeerId) -> usize {
        let message = InboundMessage {
            topic: publication.topic.clone(),
            data: publication.data.clone(),
            origin: publication.origin.clone(),
            received_from: received_from.clone(),
        };
        self.subscriptions.lock().deliver(&message)
    }

    /// Send a publication to every interested peer except its origin and the
    /// neighbour it came from.
    fn forward(&self, publication: &Publication, from: Option<&PeerId>) -> usize {
        let targets: Vec<PeerConnection> = self
            .connections
            .read()
            .values()
            .filter(|c| Some(c.peer_id()) != from && c.peer_id() != &publication.origin)
            .filter(|c| c.is_subscribed(&publication.topic))
            .cloned()
            .collect();

        let mut sent = 0;
        for connection in targets {
            match connection.send(Frame::Publish(publication.clone())) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Publish to {} failed: {e}", connection.peer_id()),
            }
        }
        sent
    }

    fn handle_frame(&self, from: &PeerId, frame: Frame) {
        match frame {
            Frame::Subscribe { topic } => {
                trace!("{from} subscribed to {topic}");
                if let Some(connection) = self.connections.read().get(from) {
                    connection.set_subscribed(topic, true);
                }
            }
            Frame::Unsubscribe { topic } => {
                trace!("{from} unsubscribed from {topic}");
                if let Some(connection) = self.connections.read().get(from) {
                    connection.set_subscribed(topic, false);
                }
            }
            Frame::Publish(publication) => {
                if !self.seen.lock().insert(&publication.id) {
                    trace!("Duplicate publication {} from {from}", publication.id);
                    return;
                }
                self.deliver_local(&publication, from);
                self.forward(&publication, Some(from));
            }
            Frame::Hello(_) => debug!("Ignoring repeated hello from {from}"),
            Frame::Goodbye => debug!("Peer {from} said goodbye"),
        }
    }

    /// Store a freshly verified connection and start reading from it.
    ///
    /// If the pair is already connected, the connection dialed by the lower
    /// peer id is kept on both sides.
    fn register<T>(self: &Arc<Self>, connection: PeerConnection, stream: FrameStream<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer_id = connection.peer_id().clone();
        {
            let mut connections = self.connections.write();
            if let Some(existing) = connections.get(&peer_id) {
                let preferred = std::cmp::min(self.peer_id(), &peer_id);
                let keep_existing =
                    existing.dialer() != connection.dialer() && existing.dialer() == preferred;
                if keep_existing {
                    debug!("Dropping duplicate connection to {peer_id}");
                    connection.close();
                    return;
                }
                existing.close();
            }
            connections.insert(peer_id.clone(), connection.clone());
        }

        let topics = self.subscriptions.lock().topics();
        for topic in topics {
            if let Err(e) = connection.send(Frame::Subscribe { topic }) {
                debug!("Initial subscription to {peer_id} not sent: {e}");
            }
        }

        info!(
            "Connected to peer {peer_id} at {}",
            connection.remote_addr()
        );
        tokio::spawn(Arc::clone(self).read_loop(connection, stream));
    }

    async fn read_loop<T>(self: Arc<Self>, connection: PeerConnection, mut stream: FrameStream<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer_id = connection.peer_id().clone();
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                        Ok(frame) => self.handle_frame(&peer_id, frame),
                        Err(e) => warn!("Bad frame from {peer_id}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Peer {peer_id} closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Read error from {peer_id}: {e}");
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&peer_id) {
                Some(current) if current.conn_id() == connection.conn_id() => {
                    connections.remove(&peer_id)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            info!("Connection to {peer_id} lost");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let host = Arc::clone(&self);
                        tokio::spawn(async move {
                            let handshake = tokio::time::timeout(
                                host.connection_timeout,
                                transport::accept_peer(stream, remote_addr, host.local_hello()),
                            )
                            .await;
                            match handshake {
                                Ok(Ok((connection, _, stream))) => host.register(connection, stream),
                                Ok(Err(e)) => warn!("Inbound handshake from {remote_addr} failed: {e}"),
                                Err(_) => warn!("Inbound handshake from {remote_addr} timed out"),
                            }
                        });
                    }
                    Err(e) => error!("TCP accept failed: {e}"),
                },
                _ = self.shutdown.cancelled() => {
                    info!("Host listener on {} shutting down", self.listen_addr);
                    break;
                }
            }
        }
    }

    /// Shut the host down: stop accepting, close every connection and end
    /// every subscription.
    pub fn close(&self) {
        self.shutdown.trigger();
        let connections: Vec<PeerConnection> =
            self.connections.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_host(name: &str) -> Arc<Host> {
        Host::bind(
            Arc::new(NodeIdentity::generate(name)),
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(5),
            Shutdown::new(),
        )
        .await
        .unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_local_publish_reaches_own_subscription() {
        let host = loopback_host("solo").await;
        let topic = host.join_topic("pomo-room-solo").unwrap();
        let mut subscription = topic.subscribe().unwrap();

        let sent = topic.publish(b"ping".to_vec()).unwrap();
        assert_eq!(sent, 0);

        let message = subscription.next().await.unwrap();
        assert_eq!(message.data, b"ping".to_vec());
        assert_eq!(&message.origin, host.peer_id());
        assert_eq!(&message.received_from, host.peer_id());
        host.close();
    }

    #[tokio::test]
    async fn test_topic_can_only_be_joined_once() {
        let host = loopback_host("topics").await;
        let topic = host.join_topic("t").unwrap();
        assert!(matches!(
            host.join_topic("t"),
            Err(NetworkError::TopicAlreadyJoined(_))
        ));

        topic.close();
        assert!(matches!(topic.publish(Vec::new()), Err(NetworkError::TopicClosed(_))));
        assert!(topic.subscribe().is_err());
        assert!(host.join_topic("t").is_ok());
        host.close();
    }

    #[tokio::test]
    async fn test_connect_and_gossip_between_hosts() {
        let a = loopback_host("a").await;
        let b = loopback_host("b").await;

        let topic_a = a.join_topic("room").unwrap();
        let mut sub_a = topic_a.subscribe().unwrap();
        let topic_b = b.join_topic("room").unwrap();
        let mut sub_b = topic_b.subscribe().unwrap();

        let remote = a.connect(&b.listen_addr().to_string()).await.unwrap();
        assert_eq!(&remote, b.peer_id());
        assert!(eventually(|| b.is_connected(a.peer_id())).await);

        // Both sides must learn the other's interest before publishing.
        let a_id = a.peer_id().clone();
        let b_id = b.peer_id().clone();
        assert!(
            eventually(|| {
                a.connections.read().get(&b_id).is_some_and(|c| c.is_subscribed("room"))
                    && b.connections.read().get(&a_id).is_some_and(|c| c.is_subscribed("room"))
            })
            .await
        );

        assert_eq!(topic_a.publish(b"hello".to_vec()).unwrap(), 1);

        let at_b = tokio::time::timeout(Duration::from_secs(2), sub_b.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_b.data, b"hello".to_vec());
        assert_eq!(&at_b.origin, a.peer_id());
        assert_eq!(&at_b.received_from, a.peer_id());

        let own = tokio::time::timeout(Duration::from_secs(2), sub_a.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(own.data, b"hello".to_vec());

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_connect_peer_rejects_wrong_identity() {
        let a = loopback_host("a").await;
        let b = loopback_host("b").await;

        let wrong = PeerId::from_string("someone-else");
        let result = a
            .connect_peer(&wrong, &[b.listen_addr().to_string()])
            .await;
        assert!(matches!(result, Err(NetworkError::Handshake(_))));

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_connect_peer_without_addresses_fails() {
        let a = loopback_host("a").await;
        let result = a.connect_peer(&PeerId::from_string("x"), &[]).await;
        assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));
        a.close();
    }

    #[tokio::test]
    async fn test_disconnect_is_observed_by_remote() {
        let a = loopback_host("a").await;
        let b = loopback_host("b").await;

        a.connect(&b.listen_addr().to_string()).await.unwrap();
        assert!(eventually(|| b.is_connected(a.peer_id())).await);

        assert!(a.disconnect(b.peer_id()));
        assert!(!a.is_connected(b.peer_id()));
        assert!(eventually(|| !b.is_connected(a.peer_id())).await);

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_closed_host_refuses_work() {
        let host = loopback_host("closing").await;
        let topic = host.join_topic("t").unwrap();
        let mut subscription = topic.subscribe().unwrap();

        host.close();
        assert!(!host.is_running());
        assert!(matches!(topic.publish(Vec::new()), Err(NetworkError::NotRunning)));
        assert!(subscription.next().await.is_none());
        assert!(matches!(
            host.connect("127.0.0.1:1").await,
            Err(NetworkError::NotRunning)
        ));
    }
}
