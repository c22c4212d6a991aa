//! Reflector -- pairs two connections that present the same relay session id
//! and then forwards bytes between them without looking at them.
//!
//! Each connection sends its session id as the first frame. The first
//! arrival waits (up to the pairing timeout) for its counterpart; once both
//! are present they each receive `{"status":"paired"}` and the streams are
//! spliced. Unknown, expired and already-paired ids are rejected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use walletlink_protocol::{FrameCodec, RelayReply, RelaySessionId};

/// Longest routing token accepted.
pub const MAX_TOKEN_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// How long the first arrival waits for its counterpart.
    pub pairing_timeout: Duration,
    /// How long a new connection has to send its token.
    pub token_timeout: Duration,
    /// Default lifetime of an opened session id.
    pub session_ttl: Duration,
    /// How often expired ids are dropped from the registry.
    pub sweep_interval: Duration,
    /// Register unknown ids on first use instead of rejecting them.
    pub accept_unregistered: bool,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(30),
            token_timeout: Duration::from_secs(5),
            session_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            accept_unregistered: false,
        }
    }
}

type PeerStream = Framed<TcpStream, FrameCodec>;

enum Slot {
    Open {
        expires: Instant,
    },
    Waiting {
        expires: Instant,
        peer: oneshot::Sender<PeerStream>,
    },
    Paired,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        match self {
            Slot::Open { expires } | Slot::Waiting { expires, .. } => *expires <= now,
            Slot::Paired => false,
        }
    }
}

enum Claim {
    /// First arrival: wait for the counterpart.
    Wait(oneshot::Receiver<PeerStream>),
    /// Second arrival: hand our stream to the waiting side.
    Join(oneshot::Sender<PeerStream>),
    Reject(&'static str),
}

struct Registry {
    slots: StdMutex<HashMap<Vec<u8>, Slot>>,
    config: ReflectorConfig,
}

impl Registry {
    fn slots(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, token: &[u8], ttl: Duration) {
        self.slots().insert(
            token.to_vec(),
            Slot::Open {
                expires: Instant::now() + ttl,
            },
        );
    }

    fn claim(&self, token: &[u8]) -> Claim {
        let now = Instant::now();
        let mut slots = self.slots();

        if slots.get(token).is_some_and(|slot| slot.expired(now)) {
            slots.remove(token);
            return Claim::Reject("session expired");
        }

        let (tx, rx) = oneshot::channel();
        match slots.remove(token) {
            None if self.config.accept_unregistered => {
                slots.insert(
                    token.to_vec(),
                    Slot::Waiting {
                        expires: now + self.config.session_ttl,
                        peer: tx,
                    },
                );
                Claim::Wait(rx)
            }
            None => Claim::Reject("unknown session"),
            Some(Slot::Open { expires }) => {
                slots.insert(token.to_vec(), Slot::Waiting { expires, peer: tx });
                Claim::Wait(rx)
            }
            Some(Slot::Waiting { peer, .. }) => {
                slots.insert(token.to_vec(), Slot::Paired);
                Claim::Join(peer)
            }
            Some(Slot::Paired) => {
                slots.insert(token.to_vec(), Slot::Paired);
                Claim::Reject("already paired")
            }
        }
    }

    /// Pairing fell through; the id can be used again until it expires.
    fn abandon(&self, token: &[u8]) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(token) {
            if !matches!(slot, Slot::Open { .. }) {
                *slot = Slot::Open {
                    expires: Instant::now() + self.config.session_ttl,
                };
            }
        }
    }

    /// Drop expired ids. Returns how many were removed.
    fn prune(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| !slot.expired(now));
        before - slots.len()
    }

    fn finish(&self, token: &[u8]) {
        self.slots().remove(token);
    }

    fn len(&self) -> usize {
        self.slots().len()
    }
}

pub struct Reflector {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl Reflector {
    pub async fn bind(addr: SocketAddr, config: ReflectorConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(Registry {
            slots: StdMutex::new(HashMap::new()),
            config,
        });
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, registry.clone(), shutdown_rx));

        tracing::info!(addr = %local_addr, "reflector listening");
        Ok(Self {
            local_addr,
            registry,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` for relay descriptors pointing at this reflector.
    pub fn host_authority(&self) -> String {
        self.local_addr.to_string()
    }

    /// Issue a fresh random session id, valid for `ttl` (or the default).
    pub fn open_session(&self, ttl: Option<Duration>) -> RelaySessionId {
        let id = RelaySessionId::random();
        self.register(&id, ttl);
        id
    }

    /// Accept a caller-chosen session id.
    pub fn register(&self, id: &RelaySessionId, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.registry.config.session_ttl);
        self.registry.open(id.as_bytes(), ttl);
        tracing::debug!(session = %hex::encode(id.as_bytes()), ?ttl, "session opened");
    }

    /// Number of tracked session ids (open, waiting or paired).
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting and drop all relayed connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.accept_task.abort();
    }
}

impl Drop for Reflector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut sweep = tokio::time::interval(registry.config.sweep_interval.max(Duration::from_millis(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let removed = registry.prune();
                if removed > 0 {
                    tracing::debug!(removed, remaining = registry.len(), "expired sessions swept");
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let registry = registry.clone();
                        let mut conn_shutdown = shutdown.resubscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = handle_connection(stream, remote, registry) => {}
                                _ = conn_shutdown.recv() => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("failed to accept connection: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal, stopping reflector");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, registry: Arc<Registry>) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::with_max_frame(MAX_TOKEN_LEN));

    let token = match tokio::time::timeout(registry.config.token_timeout, framed.next()).await {
        Ok(Some(Ok(token))) if !token.is_empty() => token,
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
            tracing::debug!(%remote, "invalid routing token");
            reject(&mut framed, "invalid token").await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::debug!(%remote, "no routing token before timeout");
            return;
        }
    };
    let session = hex::encode(&token);

    match registry.claim(&token) {
        Claim::Reject(reason) => {
            tracing::info!(%remote, %session, %reason, "rejecting relay connection");
            reject(&mut framed, reason).await;
        }
        Claim::Join(waiting) => {
            if let Err(mut framed) = waiting.send(framed) {
                registry.abandon(&token);
                reject(&mut framed, "no peer").await;
            }
        }
        Claim::Wait(mut peer) => {
            let outcome = tokio::select! {
                joined = &mut peer => joined.ok(),
                // Nothing is expected before pairing: data or EOF means the waiter is gone.
                _ = framed.next() => {
                    registry.abandon(&token);
                    tracing::info!(%remote, %session, "waiting side left before pairing");
                    if let Ok(mut joined) = peer.try_recv() {
                        reject(&mut joined, "no peer").await;
                    }
                    return;
                }
                _ = tokio::time::sleep(registry.config.pairing_timeout) => None,
            };
            match outcome {
                Some(peer) => {
                    splice(framed, peer, &session).await;
                    registry.finish(&token);
                }
                None => {
                    registry.abandon(&token);
                    tracing::info!(%remote, %session, "no peer before pairing timeout");
                    if let Ok(mut joined) = peer.try_recv() {
                        reject(&mut joined, "no peer").await;
                    }
                    reject(&mut framed, "no peer").await;
                }
            }
        }
    }
}

async fn reject(framed: &mut PeerStream, reason: &str) {
    let reply = RelayReply::Rejected {
        reason: reason.to_string(),
    };
    if let Ok(payload) = serde_json::to_vec(&reply) {
        let _ = framed.send(Bytes::from(payload)).await;
    }
}

async fn splice(mut first: PeerStream, mut second: PeerStream, session: &str) {
    let paired = match serde_json::to_vec(&RelayReply::Paired) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            tracing::warn!("failed to encode pairing reply: {e}");
            return;
        }
    };
    if first.send(paired.clone()).await.is_err() || second.send(paired).await.is_err() {
        tracing::debug!(%session, "peer left before pairing completed");
        return;
    }
    tracing::info!(%session, "relay paired");

    let first = first.into_parts();
    let second = second.into_parts();
    let (mut a, mut b) = (first.io, second.io);
    if !first.read_buf.is_empty() && b.write_all(&first.read_buf).await.is_err() {
        return;
    }
    if !second.read_buf.is_empty() && a.write_all(&second.read_buf).await.is_err() {
        return;
    }

    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => tracing::debug!(%session, up, down, "relay finished"),
        Err(e) => tracing::debug!(%session, "relay ended: {e}"),
    }
}
