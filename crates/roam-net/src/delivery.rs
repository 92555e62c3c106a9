//! The delivery service: listener, outbound posting, error reporting

use crate::{NetError, WorkerTracker};
use async_trait::async_trait;
use roam_proto::{kind, Envelope, EnvelopeCodec};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reason codes reported when an envelope could not be delivered.
///
/// Reporting is best-effort: an owner must not assume the callback fires
/// for every lost envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorCode {
    /// The recipient base could not be reached
    BaseUnreachable,
    /// The base was reached but the named agent is not resident there
    AgentUnreachable,
    /// This base is offline and cannot send
    BaseOffline,
}

/// The one fixed owner of a delivery service.
///
/// Inbound envelopes and delivery failures always go to the owner, never to
/// whichever caller happened to post the envelope. `on_envelope` runs on
/// the dedicated worker of the connection that carried the envelope, so an
/// owner may block in it without stalling the listener.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// An envelope has arrived
    async fn on_envelope(&self, envelope: Envelope);

    /// An outbound envelope could not be delivered
    async fn on_delivery_error(&self, id: u64, code: DeliveryErrorCode);
}

struct ListenerState {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    port: u16,
}

/// Sends and receives envelopes over point-to-point TCP connections.
///
/// Each transfer gets its own short-lived worker: `post` spawns one to
/// connect, write a single envelope, and close; the listener spawns one per
/// accepted connection to read a single envelope and hand it to the owner.
/// No retry is built in; redelivery is the owner's decision.
pub struct Delivery {
    owner: Arc<dyn DeliveryHandler>,
    workers: WorkerTracker,
    listener: Mutex<Option<ListenerState>>,
}

impl Delivery {
    /// Create a delivery service reporting to `owner`
    pub fn new(owner: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            owner,
            workers: WorkerTracker::new(),
            listener: Mutex::new(None),
        }
    }

    /// Tracker of in-flight transfer workers
    pub fn workers(&self) -> &WorkerTracker {
        &self.workers
    }

    /// Port the listener is bound to, if online
    pub async fn port(&self) -> Option<u16> {
        self.listener.lock().await.as_ref().map(|l| l.port)
    }

    /// Deliver `envelope` to its recipient, fire-and-forget.
    ///
    /// Failure is reported to the owner through `on_delivery_error`; the
    /// caller learns nothing, by design of the asynchronous message model.
    pub fn post(&self, envelope: Envelope) {
        let owner = Arc::clone(&self.owner);
        let guard = self.workers.register();
        tokio::spawn(async move {
            let _guard = guard;
            let id = envelope.id;
            debug!(envelope = %envelope, "sending envelope");
            if let Err(e) = Self::transfer(envelope).await {
                warn!("envelope delivery failed: {}", e);
                owner
                    .on_delivery_error(id, DeliveryErrorCode::BaseUnreachable)
                    .await;
            }
        });
    }

    async fn transfer(envelope: Envelope) -> Result<(), NetError> {
        let addr = envelope
            .recipient
            .socket_addr()
            .ok_or(NetError::Unaddressable)?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::Connection(format!("connect {}: {}", addr, e)))?;
        let codec = EnvelopeCodec::new();
        codec.write_envelope(&mut stream, &envelope).await?;
        Ok(())
    }

    /// Start accepting inbound connections on `port`.
    ///
    /// Binds all interfaces; pass port `0` to let the OS pick. Returns the
    /// actual bound port.
    pub async fn online(&self, port: u16) -> Result<u16, NetError> {
        let mut listener_slot = self.listener.lock().await;
        if listener_slot.is_some() {
            return Err(NetError::AlreadyOnline);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(NetError::Bind)?;
        let bound_port = listener.local_addr().map_err(NetError::Bind)?.port();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let owner = Arc::clone(&self.owner);
        let workers = self.workers.clone();

        let task = tokio::spawn(async move {
            info!(port = bound_port, "transport listener online");
            loop {
                tokio::select! {
                    // the termination signal is observed promptly even while
                    // accept() is pending
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            Self::spawn_receiver(stream, peer.ip(), Arc::clone(&owner), &workers);
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    },
                }
            }
            info!(port = bound_port, "transport listener stopped");
        });

        *listener_slot = Some(ListenerState {
            shutdown: shutdown_tx,
            task,
            port: bound_port,
        });
        Ok(bound_port)
    }

    fn spawn_receiver(
        mut stream: TcpStream,
        peer: std::net::IpAddr,
        owner: Arc<dyn DeliveryHandler>,
        workers: &WorkerTracker,
    ) {
        let guard = workers.register();
        tokio::spawn(async move {
            let _guard = guard;
            let mut codec = EnvelopeCodec::new();
            match codec.read_envelope(&mut stream).await {
                Ok(Some(mut envelope)) => {
                    if envelope.is_kind(kind::GET_ADDRESS) {
                        // a base behind dynamic addressing does not know its
                        // own host; substitute the observed peer address
                        envelope.sender.host = Some(peer);
                    }
                    debug!(envelope = %envelope, "envelope arrived");
                    owner.on_envelope(envelope).await;
                }
                Ok(None) => debug!("peer closed connection without an envelope"),
                Err(e) => warn!("dropping malformed envelope from {}: {}", peer, e),
            }
        });
    }

    /// Stop the listener.
    ///
    /// Outstanding transfer workers are not cancelled; they finish or fail
    /// independently.
    pub async fn offline(&self) {
        let state = self.listener.lock().await.take();
        if let Some(state) = state {
            let _ = state.shutdown.send(true);
            let _ = state.task.await;
        }
    }

    /// Whether the listener is currently accepting connections
    pub async fn is_online(&self) -> bool {
        self.listener.lock().await.is_some()
    }
}
