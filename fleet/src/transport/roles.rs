//! Publisher, Subscriber, Sender and Receiver.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    peers::PeerSet,
    reconnect::ReconnectPolicy,
    socket::{Role, Socket, SocketOptions},
    MessageSource,
};
use crate::{address::NodeAddress, error::TransportError, message::Message, sink::SharedSink};

/// Binds one endpoint and broadcasts to every connected subscriber.
#[derive(Debug, Clone)]
pub struct Publisher {
    socket: Socket,
}

impl Publisher {
    pub fn new(sink: SharedSink) -> Self {
        Self::with_options(SocketOptions::default(), sink)
    }

    pub fn with_options(options: SocketOptions, sink: SharedSink) -> Self {
        Self {
            socket: Socket::new(Role::Publisher, options, sink),
        }
    }

    pub async fn bind(&self, address: &NodeAddress) -> Result<SocketAddr, TransportError> {
        self.socket.bind(address).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    /// Returns how many subscribers the message was queued for.
    pub async fn send(&self, msg: &Message) -> Result<usize, TransportError> {
        self.socket.send(msg).await
    }

    /// Drop every subscriber connection.
    pub async fn disconnect(&self) {
        self.socket.disconnect(true).await
    }

    pub async fn close(&self) {
        self.socket.close().await
    }
}

/// Dials publishers and yields the messages that match its prefix filter.
#[derive(Debug, Clone)]
pub struct Subscriber {
    socket: Socket,
}

impl Subscriber {
    pub fn new(sink: SharedSink) -> Self {
        Self::with_options(SocketOptions::default(), sink)
    }

    pub fn with_options(options: SocketOptions, sink: SharedSink) -> Self {
        Self {
            socket: Socket::new(Role::Subscriber, options, sink),
        }
    }

    /// Accept only messages whose encoding starts with `prefix`. The first
    /// byte of an encoded message is its action, so a one-byte prefix
    /// subscribes to a single action. Empty accepts everything.
    pub fn set_subscribe(&self, prefix: impl Into<Bytes>) {
        self.socket.set_subscribe(prefix.into())
    }

    pub fn add_node_info(&self, peer: NodeAddress) -> bool {
        self.socket.add_node_info(peer)
    }

    pub fn remove_node_info(&self, peer: &NodeAddress) -> bool {
        self.socket.remove_node_info(peer)
    }

    pub fn peers(&self) -> PeerSet {
        self.socket.peers()
    }

    pub async fn connect(&self) -> Result<usize, TransportError> {
        self.socket.connect().await
    }

    pub async fn connect_with_retry(&self, policy: &ReconnectPolicy) -> Result<usize, TransportError> {
        self.socket.connect_with_retry(policy).await
    }

    pub async fn disconnect(&self, all: bool) {
        self.socket.disconnect(all).await
    }

    pub async fn recv(&self) -> Result<Message, TransportError> {
        self.socket.recv().await
    }

    pub async fn close(&self) {
        self.socket.close().await
    }
}

/// Point-to-point writer to every current peer.
#[derive(Debug, Clone)]
pub struct Sender {
    socket: Socket,
}

impl Sender {
    pub fn new(sink: SharedSink) -> Self {
        Self::with_options(SocketOptions::default(), sink)
    }

    pub fn with_options(options: SocketOptions, sink: SharedSink) -> Self {
        Self {
            socket: Socket::new(Role::Sender, options, sink),
        }
    }

    pub fn add_node_info(&self, peer: NodeAddress) -> bool {
        self.socket.add_node_info(peer)
    }

    pub fn remove_node_info(&self, peer: &NodeAddress) -> bool {
        self.socket.remove_node_info(peer)
    }

    pub fn peers(&self) -> PeerSet {
        self.socket.peers()
    }

    pub async fn connect(&self) -> Result<usize, TransportError> {
        self.socket.connect().await
    }

    pub async fn connect_with_retry(&self, policy: &ReconnectPolicy) -> Result<usize, TransportError> {
        self.socket.connect_with_retry(policy).await
    }

    pub async fn disconnect(&self, all: bool) {
        self.socket.disconnect(all).await
    }

    pub async fn send(&self, msg: &Message) -> Result<usize, TransportError> {
        self.socket.send(msg).await
    }

    pub async fn close(&self) {
        self.socket.close().await
    }
}

/// Point-to-point listener.
#[derive(Debug, Clone)]
pub struct Receiver {
    socket: Socket,
}

impl Receiver {
    pub fn new(sink: SharedSink) -> Self {
        Self::with_options(SocketOptions::default(), sink)
    }

    pub fn with_options(options: SocketOptions, sink: SharedSink) -> Self {
        Self {
            socket: Socket::new(Role::Receiver, options, sink),
        }
    }

    pub async fn bind(&self, address: &NodeAddress) -> Result<SocketAddr, TransportError> {
        self.socket.bind(address).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn recv(&self) -> Result<Message, TransportError> {
        self.socket.recv().await
    }

    pub async fn close(&self) {
        self.socket.close().await
    }
}

#[async_trait]
impl MessageSource for Subscriber {
    async fn recv(&self) -> Result<Message, TransportError> {
        Subscriber::recv(self).await
    }
}

#[async_trait]
impl MessageSource for Receiver {
    async fn recv(&self) -> Result<Message, TransportError> {
        Receiver::recv(self).await
    }
}
