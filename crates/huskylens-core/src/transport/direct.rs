//! Direct I2C transport
//!
//! The host owns the bus exclusively, so a write never has to wait for
//! another user. The HuskyLens answers through its output buffer: after each
//! command frame the response is read back right away and published to
//! subscribers, which makes the exchange synchronous from the engine's view.
//!
//! `embedded_hal` buses block, so each exchange runs on tokio's blocking
//! pool. The write future stays cancellable and the queue's recovery timer
//! keeps running while the bus is stuck.
//!
//! # Read sequence
//!
//! 1. Read the 5-byte header and take the payload length from it
//! 2. Read payload and checksum
//! 3. If the frame is `RETURN_INFO`, read the announced number of record
//!    frames the same way

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use embedded_hal::i2c::I2c;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{ChannelId, Transport, DATA_CHANNEL_CAPACITY};
use crate::protocol::{FrameCodec, Opcode, TransportError, HEADER_LEN};
use crate::queue::BusyGate;

/// Bus state shared with the blocking exchange task
struct Bus<I2C> {
    i2c: Mutex<I2C>,
    address: u8,
    codec: FrameCodec,
}

impl<I2C: I2c> Bus<I2C> {
    fn read_frame(&self, i2c: &mut I2C) -> Result<Vec<u8>, TransportError> {
        let mut frame = vec![0u8; HEADER_LEN];
        i2c.read(self.address, &mut frame).map_err(bus_error)?;

        let total = match self.codec.frame_len(&frame) {
            Ok(Some(total)) => total,
            // Hand garbage up as-is; the decoder reports it
            _ => return Ok(frame),
        };
        frame.resize(total, 0);
        i2c.read(self.address, &mut frame[HEADER_LEN..])
            .map_err(bus_error)?;
        Ok(frame)
    }

    fn exchange(&self, bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut i2c = self.i2c.lock().unwrap_or_else(PoisonError::into_inner);

        i2c.write(self.address, bytes).map_err(bus_error)?;

        let first = self.read_frame(&mut i2c)?;
        let records = match self.codec.decode(&first) {
            Ok(frame) if frame.kind == Opcode::ReturnInfo => {
                frame.field(0).unwrap_or(0) as usize
            }
            _ => 0,
        };

        let mut response = first;
        for _ in 0..records {
            response.extend(self.read_frame(&mut i2c)?);
        }
        trace!(
            address = self.address,
            records,
            "Read {} response bytes",
            response.len()
        );
        Ok(response)
    }
}

fn bus_error<E: embedded_hal::i2c::Error>(err: E) -> TransportError {
    TransportError::Bus(format!("{:?}", err.kind()))
}

/// HuskyLens on a point-to-point I2C bus
///
/// `I2C` is any blocking `embedded_hal::i2c::I2c` bus.
pub struct DirectTransport<I2C> {
    bus: Arc<Bus<I2C>>,
    data_tx: broadcast::Sender<Vec<u8>>,
    gate: Arc<BusyGate>,
    connected: AtomicBool,
}

impl<I2C> DirectTransport<I2C>
where
    I2C: I2c + Send + 'static,
{
    /// Wrap a bus, addressing the device at the profile's I2C address
    pub fn new(i2c: I2C, codec: FrameCodec) -> Self {
        let address = codec.profile().i2c_address;
        Self::with_address(i2c, codec, address)
    }

    /// Wrap a bus, addressing the device at a custom 7-bit address
    pub fn with_address(i2c: I2C, codec: FrameCodec, address: u8) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        Self {
            bus: Arc::new(Bus {
                i2c: Mutex::new(i2c),
                address,
                codec,
            }),
            data_tx,
            gate: BusyGate::shared(),
            connected: AtomicBool::new(true),
        }
    }

    /// Get the I2C address
    pub fn address(&self) -> u8 {
        self.bus.address
    }

    /// Mark the device as unplugged or back
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Release the I2C bus. Returns `None` while an abandoned exchange
    /// still holds it.
    pub fn release(self) -> Option<I2C> {
        Arc::try_unwrap(self.bus)
            .ok()
            .map(|bus| bus.i2c.into_inner().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<I2C> Transport for DirectTransport<I2C>
where
    I2C: I2c + Send + 'static,
{
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn can_write_now(&self) -> bool {
        true
    }

    async fn write(&self, _channel: ChannelId, bytes: &[u8]) -> Result<(), TransportError> {
        let bus = Arc::clone(&self.bus);
        let bytes = bytes.to_vec();
        let response = tokio::task::spawn_blocking(move || bus.exchange(&bytes))
            .await
            .map_err(|e| TransportError::Bus(format!("bus task failed: {}", e)))??;

        if self.data_tx.send(response).is_err() {
            debug!("Response read with no subscriber");
        }
        Ok(())
    }

    fn on_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.data_tx.subscribe()
    }

    fn busy_gate(&self) -> Arc<BusyGate> {
        Arc::clone(&self.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::protocol::{Command, ProtocolError};
    use crate::queue::CommandQueue;
    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    /// Bus that records writes and serves reads from a byte queue
    #[derive(Default)]
    struct MockBus {
        writes: Vec<(u8, Vec<u8>)>,
        output: VecDeque<u8>,
        nack: bool,
        read_stall: Duration,
    }

    impl ErrorType for MockBus {
        type Error = ErrorKind;
    }

    impl I2c for MockBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if self.nack {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(data) => self.writes.push((address, data.to_vec())),
                    Operation::Read(buf) => {
                        std::thread::sleep(self.read_stall);
                        for b in buf.iter_mut() {
                            *b = self.output.pop_front().unwrap_or(0);
                        }
                    }
                }
            }
            Ok(())
        }
    }

    fn record(codec: &FrameCodec, kind: Opcode, fields: [u16; 5]) -> Vec<u8> {
        let payload: Vec<u8> = fields.iter().flat_map(|f| f.to_le_bytes()).collect();
        codec.encode_frame(kind, &payload).unwrap()
    }

    #[tokio::test]
    async fn test_reads_info_and_records() {
        let codec = FrameCodec::default();
        let mut bus = MockBus::default();
        let mut expected = record(&codec, Opcode::ReturnInfo, [2, 1, 5, 0, 0]);
        expected.extend(record(&codec, Opcode::ReturnBlock, [10, 20, 30, 40, 1]));
        expected.extend(record(&codec, Opcode::ReturnArrow, [1, 2, 3, 4, 0]));
        bus.output.extend(expected.iter().copied());
        // Bytes past the response must stay unread
        bus.output.extend([0xEE, 0xEE]);

        let transport = DirectTransport::new(bus, codec.clone());
        let mut rx = transport.on_data();
        let request = codec.encode(&Command::Request).unwrap();
        transport.write(ChannelId::default(), &request).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), expected);
        let bus = transport.release().unwrap();
        assert_eq!(bus.writes, vec![(0x32, request)]);
        assert_eq!(bus.output.len(), 2);
    }

    #[tokio::test]
    async fn test_reads_every_announced_record() {
        let codec = FrameCodec::default();
        let mut bus = MockBus::default();
        let mut expected = record(&codec, Opcode::ReturnInfo, [70, 1, 1, 0, 0]);
        for i in 0..70 {
            expected.extend(record(&codec, Opcode::ReturnBlock, [i, i, 2, 2, 1]));
        }
        bus.output.extend(expected.iter().copied());

        let transport = DirectTransport::new(bus, codec.clone());
        let mut rx = transport.on_data();
        let request = codec.encode(&Command::Request).unwrap();
        transport.write(ChannelId::default(), &request).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), expected);
        assert!(transport.release().unwrap().output.is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_single_frame() {
        let codec = FrameCodec::default();
        let mut bus = MockBus::default();
        let ok = codec.encode_frame(Opcode::ReturnOk, &[]).unwrap();
        bus.output.extend(ok.iter().copied());

        let transport = DirectTransport::with_address(bus, codec.clone(), 0x33);
        let mut rx = transport.on_data();
        let knock = codec.encode(&Command::Knock).unwrap();
        transport.write(ChannelId::default(), &knock).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), ok);
        assert_eq!(transport.address(), 0x33);
        assert_eq!(transport.release().unwrap().writes[0].0, 0x33);
    }

    #[tokio::test]
    async fn test_nack_is_bus_error() {
        let bus = MockBus {
            nack: true,
            ..Default::default()
        };
        let transport = DirectTransport::new(bus, FrameCodec::default());
        let err = transport.write(ChannelId::default(), &[0x55]).await.unwrap_err();
        assert!(matches!(err, TransportError::Bus(_)));
        assert!(transport.can_write_now());
    }

    #[tokio::test]
    async fn test_stalled_bus_trips_recovery_timeout() {
        let bus = MockBus {
            read_stall: Duration::from_millis(400),
            ..Default::default()
        };
        let transport = Arc::new(DirectTransport::new(bus, FrameCodec::default()));
        let queue = CommandQueue::spawn(
            Arc::clone(&transport),
            QueueConfig {
                retry_delay_ms: 1,
                recovery_timeout_ms: 50,
            },
        );

        let started = Instant::now();
        let err = queue.send(ChannelId::default(), vec![0x55]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelBusyTimeout));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!transport.busy_gate().is_busy());
        assert_eq!(queue.stats().recoveries, 1);
    }
}
