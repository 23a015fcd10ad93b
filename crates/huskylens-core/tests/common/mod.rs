//! Scripted in-memory transport shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use huskylens_core::prelude::*;
use huskylens_core::protocol::TransportError;
use huskylens_core::queue::BusyGate;

/// What the mock does after a write
#[derive(Debug, Clone)]
pub enum Response {
    /// Publish these chunks one by one
    Chunks(Vec<Vec<u8>>),
    /// Complete the write and send nothing back
    Silent,
    /// Never complete the write
    Hang,
    /// Fail the write
    Fail,
}

impl Response {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Response::Chunks(vec![bytes])
    }
}

/// Writes currently inside the transport, possibly across several mocks
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockLens {
    connected: AtomicBool,
    writable: AtomicBool,
    gate: Arc<BusyGate>,
    in_flight: Arc<InFlight>,
    data_tx: broadcast::Sender<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    responses: Mutex<VecDeque<Response>>,
    write_delay: Mutex<Duration>,
}

impl MockLens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_parts(BusyGate::shared(), Arc::default()))
    }

    /// A second device behind the same physical channel as `other`
    pub fn sharing(other: &MockLens) -> Arc<Self> {
        Arc::new(Self::with_parts(
            Arc::clone(&other.gate),
            Arc::clone(&other.in_flight),
        ))
    }

    fn with_parts(gate: Arc<BusyGate>, in_flight: Arc<InFlight>) -> Self {
        let (data_tx, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            gate,
            in_flight,
            data_tx,
            writes: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn script(&self, response: Response) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub fn gate(&self) -> &Arc<BusyGate> {
        &self.gate
    }
}

impl Transport for MockLens {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn can_write_now(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    async fn write(&self, _channel: ChannelId, bytes: &[u8]) -> Result<(), TransportError> {
        let _guard = self.in_flight.enter();
        self.writes.lock().unwrap().push(bytes.to_vec());

        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Response::Silent);
        match response {
            Response::Chunks(chunks) => {
                for chunk in chunks {
                    let _ = self.data_tx.send(chunk);
                }
                Ok(())
            }
            Response::Silent => Ok(()),
            Response::Hang => std::future::pending().await,
            Response::Fail => Err(TransportError::Link("scripted failure".into())),
        }
    }

    fn on_data(&self) -> broadcast::Receiver<Vec<u8>> {
        self.data_tx.subscribe()
    }

    fn busy_gate(&self) -> Arc<BusyGate> {
        Arc::clone(&self.gate)
    }
}

fn codec() -> FrameCodec {
    FrameCodec::default()
}

fn record(kind: Opcode, fields: [u16; 5]) -> Vec<u8> {
    let payload: Vec<u8> = fields.iter().flat_map(|f| f.to_le_bytes()).collect();
    codec().encode_frame(kind, &payload).unwrap()
}

pub fn info(count: u16, learned: u16, frame_number: u16) -> Vec<u8> {
    record(Opcode::ReturnInfo, [count, learned, frame_number, 0, 0])
}

pub fn block(x: u16, y: u16, w: u16, h: u16, id: u16) -> Vec<u8> {
    record(Opcode::ReturnBlock, [x, y, w, h, id])
}

pub fn arrow(x0: u16, y0: u16, x1: u16, y1: u16, id: u16) -> Vec<u8> {
    record(Opcode::ReturnArrow, [x0, y0, x1, y1, id])
}

pub fn ok() -> Vec<u8> {
    codec().encode_frame(Opcode::ReturnOk, &[]).unwrap()
}

pub fn busy() -> Vec<u8> {
    codec().encode_frame(Opcode::ReturnBusy, &[]).unwrap()
}

pub fn encoded(command: &Command) -> Vec<u8> {
    codec().encode(command).unwrap()
}

/// Concatenate frames into one chunk
pub fn response(frames: &[Vec<u8>]) -> Response {
    Response::bytes(frames.concat())
}
