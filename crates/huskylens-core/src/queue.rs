//! Command queue and busy gate
//!
//! A shared transport must never see two writes at once, or responses get
//! attributed to the wrong command. Every write goes through a
//! [`CommandQueue`] actor that dispatches one command at a time, in
//! submission order, and only while the channel's [`BusyGate`] is free.
//!
//! The gate is the only shared mutable state on a channel. Its mutators are
//! private to this module; transports hand out the gate guarding their
//! physical channel and may only read it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;
use crate::protocol::ProtocolError;
use crate::transport::{ChannelId, Transport};

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    generation: u64,
}

/// Busy flag guarding one physical channel
///
/// A relayed BLE bridge shares a single gate among every protocol instance
/// that talks through it. Direct transports own a private gate.
#[derive(Debug, Default)]
pub struct BusyGate {
    state: Mutex<GateState>,
}

impl BusyGate {
    /// Create a free gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a free gate ready to be shared
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Whether a write currently holds the channel
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(self: &Arc<Self>) -> Option<Lease> {
        let mut state = self.lock();
        if state.busy {
            return None;
        }
        state.busy = true;
        state.generation = state.generation.wrapping_add(1);
        Some(Lease {
            gate: Arc::clone(self),
            generation: state.generation,
        })
    }

    /// Clear the flag if `generation` still holds it. A lease from an
    /// earlier dispatch never clears a later one.
    fn clear(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.busy && state.generation == generation {
            state.busy = false;
            true
        } else {
            false
        }
    }
}

/// Ownership of the busy flag for one dispatch. Dropping it clears the flag.
#[derive(Debug)]
struct Lease {
    gate: Arc<BusyGate>,
    generation: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.gate.clear(self.generation) {
            trace!(generation = self.generation, "Stale lease released");
        }
    }
}

/// A command waiting for the channel
pub struct PendingCommand {
    /// Target channel on the transport
    pub channel: ChannelId,
    /// Encoded frame
    pub bytes: Vec<u8>,
    reply: oneshot::Sender<Result<(), ProtocolError>>,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    busy_retries: AtomicU64,
    recoveries: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of queue activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Commands handed to the transport
    pub dispatched: u64,
    /// Re-attempts while the channel was busy
    pub busy_retries: u64,
    /// Busy flags force-cleared by the recovery timer
    pub recoveries: u64,
    /// Commands dropped because the transport was disconnected
    pub dropped: u64,
}

/// Handle to the single-writer queue task
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<PendingCommand>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the queue task for a transport. Must be called from within a
    /// tokio runtime.
    pub fn spawn<T: Transport>(transport: Arc<T>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let gate = transport.busy_gate();

        let worker = Worker {
            transport,
            gate,
            retry_delay: config.retry_delay(),
            recovery_timeout: config.recovery_timeout(),
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            tx,
            cancel,
            counters,
            task,
        }
    }

    /// Queue a frame and wait until it has been written
    ///
    /// Resolves once the transport finished the write, the recovery timer
    /// fired, or the command was dropped on disconnect.
    pub async fn send(&self, channel: ChannelId, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingCommand {
                channel,
                bytes,
                reply: reply_tx,
            })
            .map_err(|_| ProtocolError::TransportDisconnected)?;

        reply_rx
            .await
            .map_err(|_| ProtocolError::TransportDisconnected)?
    }

    /// Activity counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            busy_retries: self.counters.busy_retries.load(Ordering::Relaxed),
            recoveries: self.counters.recoveries.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the queue task. Commands still waiting are answered with
    /// `TransportDisconnected`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the queue task has exited
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<T> {
    transport: Arc<T>,
    gate: Arc<BusyGate>,
    retry_delay: Duration,
    recovery_timeout: Duration,
    counters: Arc<Counters>,
}

impl<T: Transport> Worker<T> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PendingCommand>, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProtocolError::TransportDisconnected),
                outcome = self.dispatch(&command) => outcome,
            };
            let _ = command.reply.send(outcome);
        }

        // Answer anything left so callers do not hang
        rx.close();
        while let Ok(command) = rx.try_recv() {
            let _ = command.reply.send(Err(ProtocolError::TransportDisconnected));
        }
        debug!("Command queue stopped");
    }

    async fn dispatch(&self, command: &PendingCommand) -> Result<(), ProtocolError> {
        let lease = loop {
            if !self.transport.is_connected() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(channel = command.channel.0, "Transport disconnected, dropping command");
                return Err(ProtocolError::TransportDisconnected);
            }
            if self.transport.can_write_now() {
                if let Some(lease) = self.gate.try_acquire() {
                    break lease;
                }
            }
            self.counters.busy_retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.retry_delay).await;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(
            channel = command.channel.0,
            generation = lease.generation,
            "Dispatching {} bytes",
            command.bytes.len()
        );

        tokio::select! {
            result = self.transport.write(command.channel, &command.bytes) => {
                drop(lease);
                result.map_err(ProtocolError::from)
            }
            _ = tokio::time::sleep(self.recovery_timeout) => {
                self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    generation = lease.generation,
                    "No write completion within {:?}, clearing busy flag",
                    self.recovery_timeout
                );
                drop(lease);
                Err(ProtocolError::ChannelBusyTimeout)
            }
        }
    }
}
