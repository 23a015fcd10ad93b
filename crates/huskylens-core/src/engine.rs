//! Protocol engine
//!
//! [`HuskylensProtocol`] is the caller-facing session over one sensor. It
//! encodes commands, pushes them through the [`CommandQueue`], collects the
//! response frames and keeps the latest [`ResultSet`].
//!
//! Caller-facing operations absorb failures: they log through `tracing` and
//! degrade to "no new data", so UI glue never has to handle errors. The
//! `try_*` variants return them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::config::HuskyLensConfig;
use crate::protocol::{Algorithm, Command, Frame, FrameCodec, Opcode, ProtocolError, TransportError};
use crate::queue::{CommandQueue, QueueStats};
use crate::result::{ArrowField, BoxField, ResultInfo, ResultKind, ResultSet};
use crate::transport::{ChannelId, Transport};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Transport is down; every operation is a no-op
    Disconnected,
    /// Transport up, device has not answered a knock yet
    Uninitialized,
    /// Device answered a knock
    Connected,
    /// An algorithm has been selected
    AlgorithmSelected,
    /// A poll exchange is in flight
    Polling,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    algorithm: Option<Algorithm>,
}

/// What a command waits for after the write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    /// Nothing; the write completing is enough
    None,
    /// A single `RETURN_OK`
    Ack,
    /// `RETURN_INFO` followed by its records
    Results,
}

/// Receive side of the session, held for a whole exchange so replies
/// cannot interleave
struct Exchange {
    rx: broadcast::Receiver<Vec<u8>>,
    /// Commands sent without waiting whose `RETURN_OK` has not been seen
    unacked: usize,
}

impl Exchange {
    /// Empty the receiver, crediting acknowledgements found in it. Returns
    /// how many bytes were thrown away.
    fn drain(&mut self, codec: &FrameCodec) -> usize {
        let mut buf = BytesMut::new();
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        let discarded = buf.len();

        let mut codec = codec.clone();
        while let Ok(Some(frame)) = Decoder::decode(&mut codec, &mut buf) {
            if frame.kind == Opcode::ReturnOk {
                self.take_ack();
            }
        }
        discarded
    }

    /// Account one acknowledgement against the outstanding ones
    fn take_ack(&mut self) -> bool {
        match self.unacked.checked_sub(1) {
            Some(left) => {
                self.unacked = left;
                true
            }
            None => false,
        }
    }
}

/// One HuskyLens session over a transport
pub struct HuskylensProtocol<T: Transport> {
    transport: Arc<T>,
    queue: CommandQueue,
    codec: FrameCodec,
    channel: ChannelId,
    response_timeout: Duration,
    exchange: tokio::sync::Mutex<Exchange>,
    results: RwLock<ResultSet>,
    session: Mutex<Session>,
}

impl<T: Transport> HuskylensProtocol<T> {
    /// Start a session. Spawns the command queue, so this must run inside a
    /// tokio runtime.
    pub fn new(transport: Arc<T>, config: &HuskyLensConfig) -> Self {
        let rx = transport.on_data();
        let queue = CommandQueue::spawn(Arc::clone(&transport), config.queue.clone());

        Self {
            transport,
            queue,
            codec: FrameCodec::new(config.profile.clone()),
            channel: ChannelId(config.relay.channel_id),
            response_timeout: config.response_timeout(),
            exchange: tokio::sync::Mutex::new(Exchange { rx, unacked: 0 }),
            results: RwLock::new(ResultSet::default()),
            session: Mutex::new(Session {
                state: SessionState::Uninitialized,
                algorithm: None,
            }),
        }
    }

    /// Transport the session runs over
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        if !self.transport.is_connected() {
            return SessionState::Disconnected;
        }
        self.session().state
    }

    /// Algorithm last selected through this session
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.session().algorithm
    }

    /// Snapshot of the latest results
    pub fn result_set(&self) -> ResultSet {
        self.results().clone()
    }

    /// Command queue counters
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stop the command queue. Later commands fail with
    /// `TransportDisconnected`.
    pub fn close(&self) {
        self.queue.close();
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn results(&self) -> std::sync::RwLockReadGuard<'_, ResultSet> {
        self.results.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_results(&self, results: ResultSet) {
        *self.results.write().unwrap_or_else(PoisonError::into_inner) = results;
    }

    // ---- Session control -------------------------------------------------

    /// Knock the device and mark the session connected
    pub async fn begin(&self) -> bool {
        match self.try_knock().await {
            Ok(()) => {
                let mut session = self.session();
                if session.state == SessionState::Uninitialized {
                    session.state = SessionState::Connected;
                }
                info!("HuskyLens answered knock");
                true
            }
            Err(e) => {
                absorb("begin", &e);
                false
            }
        }
    }

    /// Whether the device answers a knock
    pub async fn knock(&self) -> bool {
        match self.try_knock().await {
            Ok(()) => true,
            Err(e) => {
                absorb("knock", &e);
                false
            }
        }
    }

    /// Knock, returning why the device did not answer
    pub async fn try_knock(&self) -> Result<(), ProtocolError> {
        self.transact(&Command::Knock, Reply::Ack, |_| Ok(())).await
    }

    /// Select an algorithm. Does nothing while disconnected.
    pub async fn init_mode(&self, algorithm: Algorithm) {
        if let Err(e) = self.try_init_mode(algorithm).await {
            absorb("init_mode", &e);
        }
    }

    /// Select an algorithm by device code
    pub async fn init_mode_code(&self, code: u8) -> Result<(), ProtocolError> {
        let algorithm = Algorithm::try_from(code)?;
        self.init_mode(algorithm).await;
        Ok(())
    }

    /// Select an algorithm, returning why the command could not be sent
    pub async fn try_init_mode(&self, algorithm: Algorithm) -> Result<(), ProtocolError> {
        self.transact(&Command::SelectAlgorithm(algorithm), Reply::None, |_| {
            let previous = {
                let mut session = self.session();
                session.state = SessionState::AlgorithmSelected;
                session.algorithm.replace(algorithm)
            };
            if previous != Some(algorithm) {
                // Results of another algorithm must not answer queries for this one
                self.replace_results(ResultSet {
                    algorithm: Some(algorithm),
                    ..ResultSet::default()
                });
                debug!(?algorithm, ?previous, "Algorithm switched, results cleared");
            }
            Ok(())
        })
        .await
    }

    // ---- Polling ---------------------------------------------------------

    /// Poll once. On success the results are replaced and `true` returned;
    /// on failure the previous results stay.
    pub async fn request(&self) -> bool {
        match self.try_request().await {
            Ok(()) => true,
            Err(e) => {
                absorb("request", &e);
                false
            }
        }
    }

    /// Poll once, returning why the results were kept
    pub async fn try_request(&self) -> Result<(), ProtocolError> {
        self.transact(&Command::Request, Reply::Results, |frames| {
            let results = ResultSet::from_frames(self.algorithm(), &frames)?;
            debug!(
                count = results.info.count,
                frame = results.info.frame_number,
                "Poll complete"
            );
            self.replace_results(results);
            Ok(())
        })
        .await
    }

    /// Number of IDs learned by the current algorithm
    ///
    /// Falls back to the count seen with the last results.
    pub async fn get_ids(&self) -> u16 {
        match self.try_get_ids().await {
            Ok(count) => count,
            Err(e) => {
                absorb("get_ids", &e);
                self.results().learned_id_count()
            }
        }
    }

    /// Ask the device for its learned-ID count
    pub async fn try_get_ids(&self) -> Result<u16, ProtocolError> {
        self.transact(&Command::RequestLearned, Reply::Results, |frames| {
            let head = frames.first().ok_or(ProtocolError::Timeout)?;
            Ok(ResultInfo::from_frame(head)?.learned_ids)
        })
        .await
    }

    // ---- Queries over the latest results ---------------------------------

    /// Whether any result of `kind` was seen in the last poll
    pub fn is_appear(&self, kind: ResultKind) -> bool {
        self.results().contains_type(kind)
    }

    /// Whether a result of `kind` with `id` was seen in the last poll
    pub fn is_appear_by_id(&self, id: i32, kind: ResultKind) -> bool {
        self.results().contains_id(id, kind)
    }

    /// Whether `id` is among the learned IDs of the last poll
    pub fn is_learned(&self, id: i32) -> bool {
        self.results().is_learned(id)
    }

    /// Field of the block nearest the screen center, 0 when there is none
    pub fn read_box(&self, field: BoxField) -> i32 {
        let profile = self.codec.profile();
        self.results()
            .nearest_to_center(profile.screen_width, profile.screen_height)
            .map_or(0, |block| block.get(field))
    }

    /// Field of the arrow nearest the screen center, 0 when there is none
    pub fn read_arrow(&self, field: ArrowField) -> i32 {
        let profile = self.codec.profile();
        self.results()
            .nearest_arrow_to_center(profile.screen_width, profile.screen_height)
            .map_or(0, |arrow| arrow.get(field))
    }

    /// Field of the first block with `id`, 0 when there is none
    pub fn box_by_id(&self, id: i32, field: BoxField) -> i32 {
        self.results()
            .first_block_by_id(id)
            .map_or(0, |block| block.get(field))
    }

    /// Field of the first arrow with `id`, 0 when there is none
    pub fn arrow_by_id(&self, id: i32, field: ArrowField) -> i32 {
        self.results()
            .first_arrow_by_id(id)
            .map_or(0, |arrow| arrow.get(field))
    }

    /// Number of results of `kind`
    pub fn count(&self, kind: ResultKind) -> usize {
        self.results().count(kind)
    }

    /// Number of results of `kind` with `id`
    pub fn count_by_id(&self, id: i32, kind: ResultKind) -> usize {
        self.results().count_by_id(id, kind)
    }

    /// Field of the `n`-th block, counting from 1
    pub fn nth_box(&self, n: usize, field: BoxField) -> i32 {
        n.checked_sub(1)
            .and_then(|index| self.results().nth_block(index).map(|b| b.get(field)))
            .unwrap_or(0)
    }

    /// Field of the `n`-th arrow, counting from 1
    pub fn nth_arrow(&self, n: usize, field: ArrowField) -> i32 {
        n.checked_sub(1)
            .and_then(|index| self.results().nth_arrow(index).map(|a| a.get(field)))
            .unwrap_or(0)
    }

    /// Field of the `n`-th block with `id`, counting from 1
    pub fn nth_box_by_id(&self, id: i32, n: usize, field: BoxField) -> i32 {
        n.checked_sub(1)
            .and_then(|index| {
                self.results()
                    .nth_block_by_id(id, index)
                    .map(|b| b.get(field))
            })
            .unwrap_or(0)
    }

    /// Field of the `n`-th arrow with `id`, counting from 1
    pub fn nth_arrow_by_id(&self, id: i32, n: usize, field: ArrowField) -> i32 {
        n.checked_sub(1)
            .and_then(|index| {
                self.results()
                    .nth_arrow_by_id(id, index)
                    .map(|a| a.get(field))
            })
            .unwrap_or(0)
    }

    // ---- Device actions --------------------------------------------------

    /// Send a command that the device acknowledges with `RETURN_OK`
    pub async fn send_command(&self, command: Command) -> Result<(), ProtocolError> {
        self.transact(&command, Reply::Ack, |_| Ok(())).await
    }

    async fn action(&self, name: &'static str, command: Command) -> bool {
        match self.send_command(command).await {
            Ok(()) => true,
            Err(e) => {
                absorb(name, &e);
                false
            }
        }
    }

    /// Learn the object in view as `id`
    pub async fn learn(&self, id: u16) -> bool {
        self.action("learn", Command::Learn(id)).await
    }

    /// Forget every ID of the current algorithm
    pub async fn forget_all(&self) -> bool {
        self.action("forget_all", Command::Forget).await
    }

    /// Give learned `id` a display name
    pub async fn set_id_name(&self, id: u8, name: &str) -> bool {
        let command = Command::SetCustomName {
            id,
            name: name.to_string(),
        };
        self.action("set_id_name", command).await
    }

    /// Draw text on screen. `x` up to 510, `y` up to 255.
    pub async fn show_text(&self, text: &str, x: u16, y: u8) -> bool {
        let command = Command::CustomText {
            text: text.to_string(),
            x,
            y,
        };
        self.action("show_text", command).await
    }

    /// Remove all custom text
    pub async fn clear_text(&self) -> bool {
        self.action("clear_text", Command::ClearText).await
    }

    /// Save a camera photo to the SD card
    pub async fn take_photo(&self) -> bool {
        self.action("take_photo", Command::Photo).await
    }

    /// Save a screenshot to the SD card
    pub async fn take_screenshot(&self) -> bool {
        self.action("take_screenshot", Command::Screenshot).await
    }

    /// Save the current model to SD card slot `n`
    pub async fn save_model(&self, n: u16) -> bool {
        self.action("save_model", Command::SaveModel(n)).await
    }

    /// Load the model in SD card slot `n`
    pub async fn load_model(&self, n: u16) -> bool {
        self.action("load_model", Command::LoadModel(n)).await
    }

    // ---- Exchange --------------------------------------------------------

    /// Run one command/response exchange. `finish` sees the collected frames
    /// while the exchange is still held, so no other command can land
    /// between the reply and what the caller makes of it.
    async fn transact<R>(
        &self,
        command: &Command,
        reply: Reply,
        finish: impl FnOnce(Vec<Frame>) -> Result<R, ProtocolError>,
    ) -> Result<R, ProtocolError> {
        if !self.transport.is_connected() {
            return Err(ProtocolError::TransportDisconnected);
        }
        let bytes = self.codec.encode(command)?;

        let mut exchange = self.exchange.lock().await;
        let stale = exchange.drain(&self.codec);
        if stale > 0 {
            debug!(
                stale,
                unacked = exchange.unacked,
                "Discarded bytes received outside an exchange"
            );
        }

        let restore = (reply == Reply::Results).then(|| {
            let mut session = self.session();
            std::mem::replace(&mut session.state, SessionState::Polling)
        });

        let frames = match self.queue.send(self.channel, bytes).await {
            Err(e) => Err(e),
            Ok(()) if reply == Reply::None => {
                exchange.unacked += 1;
                Ok(Vec::new())
            }
            Ok(()) => self.collect(&mut exchange, reply).await,
        };
        let outcome = frames.and_then(finish);

        if let Some(previous) = restore {
            self.session().state = previous;
        }
        outcome
    }

    async fn collect(
        &self,
        exchange: &mut Exchange,
        reply: Reply,
    ) -> Result<Vec<Frame>, ProtocolError> {
        let deadline = Instant::now() + self.response_timeout;
        let mut codec = self.codec.clone();
        let mut buf = BytesMut::new();
        let mut frames: Vec<Frame> = Vec::new();
        let mut expected = 0usize;

        loop {
            while let Some(frame) = Decoder::decode(&mut codec, &mut buf)? {
                match (reply, frames.is_empty(), frame.kind) {
                    (_, _, Opcode::ReturnBusy) => {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: if reply == Reply::Ack {
                                Opcode::ReturnOk
                            } else {
                                Opcode::ReturnInfo
                            },
                            actual: Opcode::ReturnBusy,
                        });
                    }
                    // Late acknowledgement of a command sent without waiting
                    (Reply::Ack, _, Opcode::ReturnOk) if exchange.take_ack() => continue,
                    (Reply::Ack, _, Opcode::ReturnOk) => return Ok(vec![frame]),
                    (Reply::Ack, _, actual) => {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: Opcode::ReturnOk,
                            actual,
                        });
                    }
                    (Reply::Results, true, Opcode::ReturnOk) => {
                        exchange.take_ack();
                        continue;
                    }
                    (Reply::Results, true, Opcode::ReturnInfo) => {
                        expected = frame.require_field(0)? as usize;
                        frames.push(frame);
                    }
                    (Reply::Results, true, actual) => {
                        return Err(ProtocolError::UnexpectedResponse {
                            expected: Opcode::ReturnInfo,
                            actual,
                        });
                    }
                    (Reply::Results, false, _) => frames.push(frame),
                    (Reply::None, _, _) => return Ok(Vec::new()),
                }

                if !frames.is_empty() && frames.len() > expected {
                    return Ok(frames);
                }
            }

            let chunk = match tokio::time::timeout_at(deadline, exchange.rx.recv()).await {
                Err(_) => {
                    // Whatever was outstanding is not coming
                    exchange.unacked = 0;
                    debug!(received = frames.len(), "Response timed out");
                    return Err(ProtocolError::Timeout);
                }
                Ok(Ok(chunk)) => chunk,
                Ok(Err(RecvError::Lagged(lost))) => {
                    return Err(TransportError::Overrun(lost).into());
                }
                Ok(Err(RecvError::Closed)) => return Err(ProtocolError::TransportDisconnected),
            };
            buf.extend_from_slice(&chunk);
        }
    }
}

fn absorb(operation: &str, err: &ProtocolError) {
    match err {
        ProtocolError::TransportDisconnected => {
            debug!(operation, "Skipped while disconnected");
        }
        _ => warn!(operation, "HuskyLens command failed: {}", err),
    }
}
