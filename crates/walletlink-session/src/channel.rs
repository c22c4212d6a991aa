//! Encrypted channel -- sequenced AEAD envelopes over a framed connection.
//!
//! Outbound: seal under the current send sequence and enqueue in one critical
//! section, so envelopes hit the wire in sequence order and a cancelled
//! caller can never leave a gap. A writer task drains the queue.
//!
//! Inbound: envelopes must arrive with exactly the expected sequence and a
//! valid tag. Anything else closes the channel for good; there is no
//! resynchronisation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use walletlink_crypto::{CryptoError, SessionCipher, SessionKeyMaterial};
use walletlink_protocol::{Envelope, FrameCodec, ProtocolError, ProtocolVersion, Role};

use crate::transport::Connection;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("channel closed")]
    Closed,
    #[error("send sequence exhausted")]
    SequenceExhausted,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

struct Outbound {
    cipher: SessionCipher,
    sequence: u32,
    queue: mpsc::UnboundedSender<Bytes>,
}

struct Inbound {
    stream: FramedRead<OwnedReadHalf, FrameCodec>,
    cipher: SessionCipher,
    sequence: u32,
}

pub struct EncryptedChannel {
    outbound: StdMutex<Option<Outbound>>,
    inbound: Mutex<Option<Inbound>>,
    /// Held only so the secret is zeroed on close. Its sequence fields seed
    /// the counters in `Outbound`/`Inbound` and go stale after that.
    keys: StdMutex<Option<SessionKeyMaterial>>,
    closed: Arc<watch::Sender<bool>>,
    role: Role,
    version: ProtocolVersion,
    peer_addr: SocketAddr,
}

impl EncryptedChannel {
    /// Take over a handshaken connection. Must be called inside a tokio runtime.
    pub fn new(
        conn: Connection,
        keys: SessionKeyMaterial,
        version: ProtocolVersion,
    ) -> Result<Self, ChannelError> {
        let peer_addr = conn.peer_addr();
        let role = keys.role;
        let send_cipher = SessionCipher::new(&keys)?;
        let recv_cipher = SessionCipher::new(&keys)?;
        let (reader, writer) = conn.into_split();

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        tokio::spawn(run_writer(writer, queue_rx, closed.clone()));

        Ok(Self {
            outbound: StdMutex::new(Some(Outbound {
                cipher: send_cipher,
                sequence: keys.send_sequence,
                queue: queue_tx,
            })),
            inbound: Mutex::new(Some(Inbound {
                stream: reader,
                cipher: recv_cipher,
                sequence: keys.receive_sequence,
            })),
            keys: StdMutex::new(Some(keys)),
            closed,
            role,
            version,
            peer_addr,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the channel is closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Encrypt `plaintext` under the next send sequence and queue it.
    pub async fn send(&self, plaintext: &[u8]) -> Result<Envelope, ChannelError> {
        let mut guard = lock(&self.outbound);
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let outbound = guard.as_mut().ok_or(ChannelError::Closed)?;
        if outbound.sequence == u32::MAX {
            drop(guard);
            self.fail("send sequence space exhausted");
            return Err(ChannelError::SequenceExhausted);
        }

        let envelope = outbound.cipher.seal(outbound.sequence, plaintext)?;
        outbound
            .queue
            .send(envelope.encode())
            .map_err(|_| ChannelError::Closed)?;
        outbound.sequence += 1;
        Ok(envelope)
    }

    /// Read, verify and decrypt the next envelope.
    pub async fn receive(&self) -> Result<Vec<u8>, ChannelError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(ChannelError::Closed);
        }

        let mut guard = self.inbound.lock().await;
        let inbound = guard.as_mut().ok_or(ChannelError::Closed)?;

        let next = tokio::select! {
            biased;
            _ = closed_rx.wait_for(|closed| *closed) => None,
            frame = inbound.stream.next() => Some(frame),
        };

        let frame = match next {
            None => {
                *guard = None;
                return Err(ChannelError::Closed);
            }
            Some(Some(Ok(frame))) => frame,
            Some(Some(Err(e))) => {
                *guard = None;
                self.fail(&format!("read failed: {e}"));
                return Err(e.into());
            }
            Some(None) => {
                *guard = None;
                if !self.closed.send_replace(true) {
                    tracing::info!(peer = %self.peer_addr, "peer closed the channel");
                }
                self.teardown();
                return Err(ChannelError::Closed);
            }
        };

        match open_envelope(inbound, &frame) {
            Ok(plaintext) => Ok(plaintext),
            Err(reason) => {
                *guard = None;
                self.fail(&reason);
                Err(ChannelError::IntegrityFailure(reason))
            }
        }
    }

    /// Close the channel and drop key material. Idempotent.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(peer = %self.peer_addr, role = self.role.as_str(), "channel closed");
        }
        self.teardown();
    }

    fn fail(&self, reason: &str) {
        if !self.closed.send_replace(true) {
            tracing::warn!(peer = %self.peer_addr, %reason, "channel failed, closing");
        }
        self.teardown();
    }

    fn teardown(&self) {
        lock(&self.outbound).take();
        lock(&self.keys).take();
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.take();
        }
    }
}

impl Drop for EncryptedChannel {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

fn open_envelope(inbound: &mut Inbound, frame: &[u8]) -> Result<Vec<u8>, String> {
    let envelope = Envelope::decode(frame).map_err(|e| e.to_string())?;
    if envelope.sequence != inbound.sequence {
        return Err(format!(
            "expected sequence {}, got {}",
            inbound.sequence, envelope.sequence
        ));
    }
    let plaintext = inbound
        .cipher
        .open(&envelope)
        .map_err(|_| format!("authentication failed at sequence {}", envelope.sequence))?;
    inbound.sequence = inbound.sequence.wrapping_add(1);
    Ok(plaintext)
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_writer(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = queue.recv() => frame,
            _ = closed_rx.wait_for(|closed| *closed) => None,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("channel write failed: {e}");
            closed.send_replace(true);
            break;
        }
    }
    let _ = sink.close().await;
}
