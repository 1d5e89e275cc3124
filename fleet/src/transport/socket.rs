//! Socket core shared by the four transport roles.
//!
//! One [`Socket`] owns an optional listener, a [`PeerSet`], one writer task
//! per outbound connection and the reader tasks feeding its inbound queue.
//! Roles differ only in which of those they use: publishers and receivers
//! bind, senders and subscribers dial; publishers and senders write,
//! subscribers and receivers read.
//!
//! Each writer drains its own bounded queue, so a peer that stops reading
//! never stalls `send` for the others. A publisher drops frames for a
//! subscriber whose queue is full; a sender reports it.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace};

use super::{peers::PeerSet, reconnect::ReconnectPolicy};
use crate::{
    address::NodeAddress,
    codec::{self, FrameBuffer, DEFAULT_MAX_FRAME_BYTES},
    error::TransportError,
    message::{Message, State},
    sink::SharedSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub max_frame_bytes: usize,
    /// Decoded messages buffered ahead of `recv`. A subscriber drops what
    /// arrives while this is full; a receiver stops reading.
    pub inbound_capacity: usize,
    /// Encoded messages queued per outbound connection.
    pub outbound_capacity: usize,
    /// A connection whose write stalls this long is dropped.
    pub write_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inbound_capacity: 1024,
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
        }
    }
}

struct Inbound {
    msg: Message,
    raw: Bytes,
}

struct Writer {
    key: String,
    queue: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SocketState {
    local_addr: Option<SocketAddr>,
    peers: PeerSet,
    subscribe: Bytes,
    readers: HashMap<String, JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
}

impl SocketState {
    fn abort_tasks(&mut self) {
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
    }
}

struct SocketInner {
    role: Role,
    options: SocketOptions,
    state: Mutex<SocketState>,
    writers: Mutex<Vec<Writer>>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    sink: SharedSink,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.state.get_mut().abort_tasks();
        for writer in self.writers.get_mut().drain(..) {
            writer.task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Socket")
            .field("role", &self.inner.role)
            .field("local_addr", &state.local_addr)
            .field("peers", &state.peers)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Socket {
    pub fn new(role: Role, options: SocketOptions, sink: SharedSink) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SocketInner {
                role,
                options,
                state: Mutex::new(SocketState::default()),
                writers: Mutex::new(Vec::new()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                shutdown,
                closed: AtomicBool::new(false),
                sink,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn add_node_info(&self, peer: NodeAddress) -> bool {
        self.inner.state.lock().peers.add(peer)
    }

    pub fn remove_node_info(&self, peer: &NodeAddress) -> bool {
        self.inner.state.lock().peers.mark_stale(peer)
    }

    pub fn peers(&self) -> PeerSet {
        self.inner.state.lock().peers.clone()
    }

    pub fn set_subscribe(&self, prefix: Bytes) {
        self.inner.state.lock().subscribe = prefix;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().local_addr
    }

    /// Listen on `address` and start accepting connections.
    ///
    /// Binding port 0 picks a free port; the returned address has the real
    /// one. Binding again replaces the previous listener.
    pub async fn bind(&self, address: &NodeAddress) -> Result<SocketAddr, TransportError> {
        self.ensure_open()?;
        let listener = TcpListener::bind(address.endpoint()).await?;
        let local = listener.local_addr()?;
        let accept = self.spawn_accept(listener);
        let previous = {
            let mut state = self.inner.state.lock();
            state.local_addr = Some(local);
            state.accept.replace(accept)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(role = %self.inner.role, %local, "Socket bound");
        Ok(local)
    }

    fn spawn_accept(&self, listener: TcpListener) -> JoinHandle<()> {
        let weak: Weak<SocketInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let socket = Socket { inner };
                match accepted {
                    Ok((stream, remote)) => socket.on_accept(stream, remote),
                    Err(e) => socket.inner.sink.err_in(&e, "accept"),
                }
            }
        })
    }

    fn on_accept(&self, stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let key = remote.to_string();
        debug!(role = %self.inner.role, peer = %key, "Accepted connection");
        match self.inner.role {
            Role::Publisher => {
                let (_, half) = stream.into_split();
                self.spawn_writer(key, half);
            }
            _ => self.spawn_reader(key, stream),
        }
    }

    fn spawn_writer(&self, key: String, half: OwnedWriteHalf) {
        let (queue, rx) = mpsc::channel(self.inner.options.outbound_capacity.max(1));
        let task = tokio::spawn(write_frames(
            half,
            rx,
            key.clone(),
            self.inner.role,
            self.inner.sink.clone(),
            self.inner.options.write_timeout,
        ));
        let mut writers = self.inner.writers.lock();
        writers.retain(|w| !w.queue.is_closed());
        writers.push(Writer { key, queue, task });
    }

    fn spawn_reader<R>(&self, key: String, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let task = tokio::spawn(read_frames(
            reader,
            key.clone(),
            self.inner.role,
            self.inner.inbound_tx.clone(),
            self.inner.sink.clone(),
            self.inner.options.max_frame_bytes,
        ));
        let mut state = self.inner.state.lock();
        state.readers.retain(|_, handle| !handle.is_finished());
        if let Some(old) = state.readers.insert(key, task) {
            old.abort();
        }
    }

    fn is_connected(&self, key: &str) -> bool {
        match self.inner.role {
            Role::Subscriber => self
                .inner
                .state
                .lock()
                .readers
                .get(key)
                .is_some_and(|handle| !handle.is_finished()),
            _ => self
                .inner
                .writers
                .lock()
                .iter()
                .any(|w| w.key == key && !w.queue.is_closed()),
        }
    }

    /// Readers stop at once; writers finish what is already queued.
    fn drop_connection(&self, key: &str) {
        let reader = self.inner.state.lock().readers.remove(key);
        if let Some(reader) = reader {
            reader.abort();
        }
        self.inner.writers.lock().retain(|w| w.key != key);
    }

    /// Tear down connections to stale peers.
    fn drop_stale(&self) -> usize {
        let stale = self.inner.state.lock().peers.take_stale();
        for peer in &stale {
            self.drop_connection(&peer.endpoint());
            debug!(role = %self.inner.role, %peer, "Disconnected stale peer");
        }
        stale.len()
    }

    /// Drop stale peers, then dial every current peer not yet connected.
    ///
    /// Returns how many new connections were made. The first dial failure is
    /// returned after every peer has been tried; later ones go to the sink.
    pub async fn connect(&self) -> Result<usize, TransportError> {
        self.ensure_open()?;
        self.drop_stale();

        let targets = self.inner.state.lock().peers.current().to_vec();
        let mut connected = 0;
        let mut first_err = None;
        for peer in targets {
            let key = peer.endpoint();
            if self.is_connected(&key) {
                continue;
            }
            match TcpStream::connect(&key).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    match self.inner.role {
                        Role::Subscriber => self.spawn_reader(key, stream),
                        _ => {
                            let (_, half) = stream.into_split();
                            self.spawn_writer(key, half);
                        }
                    }
                    debug!(role = %self.inner.role, %peer, "Connected");
                    connected += 1;
                }
                Err(source) => {
                    let err = TransportError::Connect {
                        peer: peer.to_string(),
                        source,
                    };
                    if first_err.is_none() {
                        first_err = Some(err);
                    } else {
                        self.inner.sink.err_in(&err, self.inner.role.as_str());
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(connected),
        }
    }

    pub async fn connect_with_retry(&self, policy: &ReconnectPolicy) -> Result<usize, TransportError> {
        let target = format!("{} peers", self.inner.role);
        policy.retry(&target, || self.connect()).await
    }

    /// Drop stale connections; with `all`, drop every connection and forget
    /// the current peers as well.
    pub async fn disconnect(&self, all: bool) {
        if all {
            self.inner.state.lock().peers.mark_all_stale();
        }
        let dropped = self.drop_stale();
        if all {
            self.inner.state.lock().readers.drain().for_each(|(_, r)| r.abort());
            self.inner.writers.lock().clear();
        }
        trace!(role = %self.inner.role, all, dropped, "Disconnected");
    }

    /// Queue `msg` on every connection.
    ///
    /// Returns the number of connections it was queued on; the writer tasks
    /// put it on the wire. Connections whose writer has stopped are dropped.
    /// A publisher skips subscribers whose queue is full and always succeeds.
    /// A sender that queued nothing returns [`TransportError::Backlogged`] or
    /// [`TransportError::ConnectionLost`] for the last peer that refused it.
    pub async fn send(&self, msg: &Message) -> Result<usize, TransportError> {
        self.ensure_open()?;
        if msg.state() == State::Local {
            return Err(TransportError::LocalOnly);
        }
        if self.inner.role == Role::Publisher && self.local_addr().is_none() {
            return Err(TransportError::NotBound);
        }

        let frame = codec::encode(msg);
        let role = self.inner.role;
        let mut delivered = 0usize;
        let mut dropped = 0u64;
        let mut last_err = None;
        {
            let mut writers = self.inner.writers.lock();
            if writers.is_empty() {
                return match role {
                    Role::Publisher => Ok(0),
                    _ => Err(TransportError::NoPeers),
                };
            }
            writers.retain(|w| match w.queue.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if role != Role::Publisher {
                        last_err = Some(TransportError::Backlogged {
                            peer: w.key.clone(),
                        });
                    }
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%role, peer = %w.key, "Dropping connection with stopped writer");
                    last_err = Some(TransportError::ConnectionLost {
                        peer: w.key.clone(),
                    });
                    false
                }
            });
        }
        counter!("fleet_transport_frames_sent_total", "role" => role.as_str())
            .increment(delivered as u64);
        if dropped > 0 {
            trace!(%role, dropped, "Outbound queue full");
            counter!("fleet_transport_frames_dropped_total", "role" => role.as_str())
                .increment(dropped);
        }

        match last_err {
            Some(e) if delivered == 0 && role != Role::Publisher => Err(e),
            _ => Ok(delivered),
        }
    }

    /// Next inbound message accepted by the subscribe prefix.
    pub async fn recv(&self) -> Result<Message, TransportError> {
        self.ensure_open()?;
        if self.inner.role == Role::Receiver && self.local_addr().is_none() {
            return Err(TransportError::NotBound);
        }
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut rx = self.inner.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.changed() => return Err(TransportError::Closed),
                inbound = rx.recv() => inbound.ok_or(TransportError::Closed)?,
            };
            let accepted = {
                let state = self.inner.state.lock();
                inbound.raw.starts_with(&state.subscribe)
            };
            if accepted {
                return Ok(inbound.msg);
            }
            trace!(action = %inbound.msg.action(), "Filtered by subscribe prefix");
        }
    }

    /// Stop background tasks and drop every connection. Pending and future
    /// `recv` calls fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        self.inner.state.lock().abort_tasks();
        for writer in self.inner.writers.lock().drain(..) {
            writer.task.abort();
        }
        debug!(role = %self.inner.role, "Socket closed");
    }
}

async fn read_frames<R>(
    mut reader: R,
    peer: String,
    role: Role,
    tx: mpsc::Sender<Inbound>,
    sink: SharedSink,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::new(max_frame_bytes);
    loop {
        match reader.read_buf(buffer.buf_mut()).await {
            Ok(0) => {
                debug!(%role, %peer, "Peer closed connection");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                sink.err_in(&e, &format!("{} read from {}", role, peer));
                return;
            }
        }
        loop {
            match buffer.next_frame() {
                Ok(Some((msg, raw))) => {
                    counter!("fleet_transport_frames_received_total", "role" => role.as_str())
                        .increment(1);
                    let inbound = Inbound { msg, raw };
                    if role == Role::Subscriber {
                        match tx.try_send(inbound) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                trace!(%role, %peer, "Inbound queue full, message dropped");
                                counter!("fleet_transport_frames_dropped_total", "role" => role.as_str())
                                    .increment(1);
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    } else if tx.send(inbound).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot be resynchronised after a bad frame.
                    sink.err_in(&e, &format!("{} decode from {}", role, peer));
                    return;
                }
            }
        }
    }
}

async fn write_frames(
    mut half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    peer: String,
    role: Role,
    sink: SharedSink,
    write_timeout: Duration,
) {
    while let Some(frame) = queue.recv().await {
        match timeout(write_timeout, half.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                sink.err_in(&e, &format!("{} write to {}", role, peer));
                return;
            }
            Err(_) => {
                let err = TransportError::WriteTimeout {
                    peer,
                    timeout: write_timeout,
                };
                sink.err_in(&err, role.as_str());
                return;
            }
        }
    }
}
