//! TCP transport sockets
//!
//! Four roles over one socket core: [`Publisher`] / [`Subscriber`] for
//! fan-out to children and [`Sender`] / [`Receiver`] for point-to-point
//! traffic towards a leader. Every frame on the wire is one encoded core
//! message.

mod peers;
mod reconnect;
mod roles;
mod socket;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

pub use peers::PeerSet;
pub use reconnect::ReconnectPolicy;
pub use roles::{Publisher, Receiver, Sender, Subscriber};
pub use socket::{Role, SocketOptions};

use crate::{error::TransportError, looper::MessageLooper, message::Message, sink::SharedSink};

/// Anything that yields inbound messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn recv(&self) -> Result<Message, TransportError>;
}

/// Forward every message from `source` into `looper`.
///
/// Receive errors are reported to `sink` and the loop keeps going; it ends
/// when the source is closed or unbound, or the looper stops accepting.
pub fn pump<S>(source: S, looper: MessageLooper, sink: SharedSink) -> JoinHandle<()>
where
    S: MessageSource + 'static,
{
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(msg) => {
                    if let Err(e) = looper.push(msg).await {
                        debug!(error = %e, "Looper stopped accepting, pump exiting");
                        break;
                    }
                }
                Err(TransportError::Closed) | Err(TransportError::NotBound) => {
                    debug!("Source closed, pump exiting");
                    break;
                }
                Err(e) => sink.err_in(&e, "pump recv"),
            }
        }
    })
}
