//! Cluster member endpoint
//!
//! A member publishes to its children on its own port and receives from them
//! on `port + 1`. Towards its leader it subscribes to the leader's publisher
//! and sends to the leader's receiver.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::info;

use crate::{
    address::{NodeAddress, NodePath},
    config::TransportConfig,
    error::{FleetResult, TransportError},
    message::Message,
    sink::SharedSink,
    transport::{Publisher, Receiver, ReconnectPolicy, Sender, SocketOptions, Subscriber},
};

#[derive(Debug)]
pub struct ClusterNode {
    path: NodePath,
    address: NodeAddress,
    receive_at: NodeAddress,
    leader: Mutex<Option<NodeAddress>>,
    publisher: Publisher,
    receiver: Receiver,
    subscriber: Subscriber,
    sender: Sender,
    policy: ReconnectPolicy,
}

impl ClusterNode {
    pub fn new(path: NodePath, config: &TransportConfig, sink: SharedSink) -> FleetResult<Self> {
        config.validate()?;
        let address = path.node_info()?;
        let receive_at = address.receiver_address()?;
        let options = SocketOptions {
            max_frame_bytes: config.max_frame_bytes,
            ..Default::default()
        };
        let subscriber = Subscriber::with_options(options.clone(), sink.clone());
        subscriber.set_subscribe(config.subscribe_filter.clone().into_bytes());
        Ok(Self {
            path,
            address,
            receive_at,
            leader: Mutex::new(None),
            publisher: Publisher::with_options(options.clone(), sink.clone()),
            receiver: Receiver::with_options(options.clone(), sink.clone()),
            subscriber,
            sender: Sender::with_options(options, sink),
            policy: config.reconnect.policy(),
        })
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn leader(&self) -> Option<NodeAddress> {
        self.leader.lock().clone()
    }

    /// Bind both listening sockets, then connect to the leader named by the
    /// path, if any.
    pub async fn join(&self) -> FleetResult<()> {
        let (publish, receive) = self.bind().await?;
        info!(path = %self.path, %publish, %receive, "Cluster node listening");
        if let Some(leader) = self.path.leader_path() {
            self.set_leader(&leader).await?;
        }
        Ok(())
    }

    pub async fn bind(&self) -> FleetResult<(SocketAddr, SocketAddr)> {
        let publish = self.publisher.bind(&self.address).await?;
        let receive = self.receiver.bind(&self.receive_at).await?;
        Ok((publish, receive))
    }

    /// Point leader traffic at the last node of `leader_path`.
    ///
    /// The previous leader's connections are marked stale and dropped by the
    /// reconnect, so both leaders are never live at once.
    pub async fn set_leader(&self, leader_path: &NodePath) -> FleetResult<()> {
        let leader = leader_path.node_info()?;
        let leader_receiver = leader.receiver_address()?;
        let previous = self.leader.lock().replace(leader.clone());
        if let Some(previous) = previous.filter(|p| p != &leader) {
            self.subscriber.remove_node_info(&previous);
            if let Ok(previous_receiver) = previous.receiver_address() {
                self.sender.remove_node_info(&previous_receiver);
            }
        }
        self.subscriber.add_node_info(leader.clone());
        self.sender.add_node_info(leader_receiver);

        self.subscriber.connect_with_retry(&self.policy).await?;
        self.sender.connect_with_retry(&self.policy).await?;
        info!(path = %self.path, %leader, "Leader connected");
        Ok(())
    }

    /// Forget the leader and drop its connections.
    pub async fn clear_leader(&self) {
        self.leader.lock().take();
        self.subscriber.disconnect(true).await;
        self.sender.disconnect(true).await;
    }

    fn require_leader(&self) -> Result<(), TransportError> {
        if self.leader.lock().is_none() {
            return Err(TransportError::NoPeers);
        }
        Ok(())
    }

    pub async fn send_to_leader(&self, msg: &Message) -> Result<usize, TransportError> {
        self.require_leader()?;
        self.sender.send(msg).await
    }

    pub async fn broadcast_to_children(&self, msg: &Message) -> Result<usize, TransportError> {
        self.publisher.send(msg).await
    }

    pub async fn recv_from_leader(&self) -> Result<Message, TransportError> {
        self.require_leader()?;
        self.subscriber.recv().await
    }

    pub async fn recv_from_children(&self) -> Result<Message, TransportError> {
        self.receiver.recv().await
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub async fn close(&self) {
        self.publisher.close().await;
        self.receiver.close().await;
        self.subscriber.close().await;
        self.sender.close().await;
    }
}
