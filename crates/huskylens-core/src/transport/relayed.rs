//! Transport through a BLE bridge
//!
//! The bridge forwards writes on one GATT characteristic to whatever sensor
//! is plugged into the channel named by the first byte. Several protocol
//! instances may share one bridge, so they also share its busy gate.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use super::{ChannelId, Transport};
use crate::config::RelayConfig;
use crate::protocol::TransportError;
use crate::queue::BusyGate;

/// Host-side BLE connection to the bridge
pub trait BridgeLink: Send + Sync + 'static {
    /// Whether the BLE connection is up
    fn is_connected(&self) -> bool;

    /// Write a value to a characteristic
    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Notifications received from the bridge
    fn notifications(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// HuskyLens reached through a shared bridge
pub struct RelayedTransport<L> {
    link: Arc<L>,
    gate: Arc<BusyGate>,
    config: RelayConfig,
}

impl<L: BridgeLink> RelayedTransport<L> {
    /// Create a transport over `link`. Pass the same `gate` to every
    /// transport built on the same link.
    pub fn new(link: Arc<L>, gate: Arc<BusyGate>, config: RelayConfig) -> Self {
        Self { link, gate, config }
    }

    /// Channel id frames from this transport are routed to
    pub fn channel(&self) -> ChannelId {
        ChannelId(self.config.channel_id)
    }

    /// Shared bridge connection
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }
}

impl<L: BridgeLink> Transport for RelayedTransport<L> {
    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn can_write_now(&self) -> bool {
        self.link.is_connected() && !self.gate.is_busy()
    }

    async fn write(&self, channel: ChannelId, bytes: &[u8]) -> Result<(), TransportError> {
        let mut packet = Vec::with_capacity(bytes.len() + 1);
        packet.push(channel.0);
        packet.extend_from_slice(bytes);
        trace!(channel = channel.0, "Relaying {} bytes", bytes.len());

        self.link
            .write(self.config.service, self.config.characteristic, packet)
            .await
    }

    fn on_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.link.notifications()
    }

    fn busy_gate(&self) -> Arc<BusyGate> {
        Arc::clone(&self.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingLink {
        connected: AtomicBool,
        writes: Mutex<Vec<(Uuid, Uuid, Vec<u8>)>>,
        tx: broadcast::Sender<Vec<u8>>,
    }

    impl RecordingLink {
        fn new() -> Self {
            let (tx, _) = broadcast::channel(8);
            Self {
                connected: AtomicBool::new(true),
                writes: Mutex::new(Vec::new()),
                tx,
            }
        }
    }

    impl BridgeLink for RecordingLink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn write(
            &self,
            service: Uuid,
            characteristic: Uuid,
            bytes: Vec<u8>,
        ) -> Result<(), TransportError> {
            self.writes
                .lock()
                .unwrap()
                .push((service, characteristic, bytes));
            Ok(())
        }

        fn notifications(&self) -> broadcast::Receiver<Vec<u8>> {
            self.tx.subscribe()
        }
    }

    #[tokio::test]
    async fn test_write_prefixes_channel() {
        let link = Arc::new(RecordingLink::new());
        let transport = RelayedTransport::new(
            Arc::clone(&link),
            BusyGate::shared(),
            RelayConfig::default(),
        );

        transport
            .write(transport.channel(), &[0x55, 0xAA, 0x11])
            .await
            .unwrap();

        let writes = link.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (service, characteristic, bytes) = &writes[0];
        assert_eq!(*service, crate::config::BRIDGE_SERVICE_UUID);
        assert_eq!(*characteristic, crate::config::BRIDGE_CHARACTERISTIC_UUID);
        assert_eq!(bytes, &vec![0x01, 0x55, 0xAA, 0x11]);
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let link = Arc::new(RecordingLink::new());
        let transport =
            RelayedTransport::new(Arc::clone(&link), BusyGate::shared(), RelayConfig::default());
        let mut rx = transport.on_data();
        link.tx.send(vec![1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_shared_gate_and_link_state() {
        let link = Arc::new(RecordingLink::new());
        let gate = BusyGate::shared();
        let a = RelayedTransport::new(Arc::clone(&link), Arc::clone(&gate), RelayConfig::default());
        let b = RelayedTransport::new(
            Arc::clone(&link),
            Arc::clone(&gate),
            RelayConfig {
                channel_id: 2,
                ..RelayConfig::default()
            },
        );
        assert!(Arc::ptr_eq(&a.busy_gate(), &b.busy_gate()));
        assert_eq!(b.channel(), ChannelId(2));
        assert!(a.can_write_now());

        link.connected.store(false, Ordering::SeqCst);
        assert!(!a.is_connected());
        assert!(!b.can_write_now());
    }
}
