//! Physical links to the sensor
//!
//! The protocol engine only sees the [`Transport`] capability set. Retry and
//! backpressure live in the [command queue](crate::queue), never in the
//! adapters.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::TransportError;
use crate::queue::BusyGate;

pub mod direct;
pub mod relayed;
pub mod serial;

pub use direct::DirectTransport;
pub use relayed::{BridgeLink, RelayedTransport};
pub use serial::{list_ports, PortInfo, SerialTransport};

/// Capacity of the receive broadcast channel, in chunks
pub const DATA_CHANNEL_CAPACITY: usize = 64;

/// Logical channel a write is addressed to
///
/// On a relayed link this is the bridge command id the peripheral routes
/// by. Point-to-point transports ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelId(pub u8);

/// Capabilities the engine needs from a link
pub trait Transport: Send + Sync + 'static {
    /// Whether the link is up. Commands are dropped while it is not.
    fn is_connected(&self) -> bool;

    /// Whether a write may start right now
    fn can_write_now(&self) -> bool;

    /// Write one encoded frame
    fn write(
        &self,
        channel: ChannelId,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to bytes arriving from the device
    fn on_data(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Gate guarding the physical channel this transport writes to
    fn busy_gate(&self) -> Arc<BusyGate>;
}
