//! Serial protocol engine: turns the half-duplex BMS link into an
//! async request/response API with bounded concurrency, retries and
//! write verification.
//!
//! Grounded on `original_source/components/tinybms_client/tinybms_client.cpp`'s
//! `perform_read_with_retry` (attempt/timeout/backoff loop, stats struct)
//! and on `TheerasakPing-bms-monitor/src/can_handler.rs`'s
//! `CanManager::query_all_data` for the "single worker drains a queue of
//! requests" shape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::event_bus::{Event, EventBus};
use crate::protocol::commands::{
    self, AckOutcome, ProtocolError, StatusPayload, StatusQueryKind,
};
use crate::protocol::frame::{extract_frame, ExtractResult, Frame};
use crate::transport::BmsTransport;

/// Default retry/timeout policy: 3 attempts, 750ms per attempt, 100ms
/// backoff between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub backoff: Duration,
    /// Minimum settle time before a write-verify readback.
    pub write_settle: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_millis(750),
            backoff: Duration::from_millis(100),
            write_settle: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerialError {
    #[error("no response within the per-attempt timeout after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("CRC mismatch on every attempt ({attempts} attempt(s))")]
    CrcMismatch { attempts: u32 },
    #[error("peer NACKed with error code 0x{0:02X}")]
    Nack(u8),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("write verify-by-readback mismatch: wrote {wrote:#06X}, read back {read_back:#06X}")]
    WriteVerifyMismatch { wrote: u16, read_back: u16 },
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("serial engine worker has shut down")]
    WorkerGone,
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    ReadRegister { addr: u16 },
    WriteRegister { addr: u16, value: u16 },
    Reset,
    BlockRead { start_addr: u16, count: u8 },
    BlockWrite { start_addr: u16, values: Vec<u16> },
    RegisterFileRead { start_addr: u16, quantity: u16 },
    RegisterFileWrite { start_addr: u16, values: Vec<u16> },
    StatusQuery { kind: StatusQueryKind },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Read { addr: u16, value: u16 },
    Write,
    Reset,
    BlockRead(Vec<u16>),
    BlockWrite,
    RegisterFileRead(Vec<u16>),
    RegisterFileWrite,
    StatusQuery(StatusPayload),
}

pub struct EngineRequest {
    pub kind: RequestKind,
    respond_to: oneshot::Sender<Result<ResponseKind, SerialError>>,
}

#[derive(Debug, Default)]
pub struct SerialStats {
    pub requests_sent: AtomicU64,
    pub responses_ok: AtomicU64,
    pub timeouts: AtomicU64,
    pub crc_errors: AtomicU64,
    pub nacks: AtomicU64,
    pub retries: AtomicU64,
    pub write_verify_failures: AtomicU64,
    /// Highest number of requests ever in flight (submitted but not yet
    /// replied to) at once.
    pub queue_high_water_mark: AtomicU64,
    /// Currently in-flight request count, used only to derive the
    /// high-water mark above.
    in_flight: AtomicU64,
    /// Running sum of round-trip latencies in microseconds, from `submit()`
    /// send to oneshot reply, divided by `latency_samples` for the mean.
    total_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerialStatsSnapshot {
    pub requests_sent: u64,
    pub responses_ok: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub nacks: u64,
    pub retries: u64,
    pub write_verify_failures: u64,
    pub queue_high_water_mark: u64,
    /// Running mean round-trip latency in microseconds; zero until the
    /// first request completes.
    pub avg_latency_us: u64,
}

impl SerialStats {
    pub fn snapshot(&self) -> SerialStatsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.total_latency_us.load(Ordering::Relaxed);
        SerialStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_ok: self.responses_ok.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            write_verify_failures: self.write_verify_failures.load(Ordering::Relaxed),
            queue_high_water_mark: self.queue_high_water_mark.load(Ordering::Relaxed),
            avg_latency_us: if samples == 0 { 0 } else { total / samples },
        }
    }

    /// Records one more request entering flight, updating the high-water
    /// mark if this is the deepest the queue has ever been.
    fn record_enqueue(&self) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.queue_high_water_mark.fetch_max(in_flight, Ordering::Relaxed);
    }

    /// Records one request leaving flight and folds its round-trip latency
    /// into the running mean.
    fn record_completion(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle used by callers to submit requests to the engine's worker task.
#[derive(Clone)]
pub struct SerialEngineHandle {
    sender: mpsc::Sender<EngineRequest>,
    stats: Arc<SerialStats>,
}

impl SerialEngineHandle {
    pub async fn submit(&self, kind: RequestKind) -> Result<ResponseKind, SerialError> {
        let (respond_to, rx) = oneshot::channel();
        self.stats.record_enqueue();
        let started = tokio::time::Instant::now();

        let send_result = self
            .sender
            .send(EngineRequest { kind, respond_to })
            .await
            .map_err(|_| SerialError::WorkerGone);
        if send_result.is_err() {
            self.stats.record_completion(started.elapsed());
            return Err(send_result.unwrap_err());
        }

        let reply = rx.await.map_err(|_| SerialError::WorkerGone);
        self.stats.record_completion(started.elapsed());
        reply?
    }

    pub fn stats(&self) -> SerialStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Spawns the worker task and returns a handle to submit requests to it.
/// `queue_capacity` bounds how many requests may be pending at once.
pub fn spawn(
    transport: Box<dyn BmsTransport>,
    policy: RetryPolicy,
    event_bus: Arc<EventBus>,
    queue_capacity: usize,
) -> (SerialEngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let stats = Arc::new(SerialStats::default());
    let worker_stats = stats.clone();
    let join = tokio::spawn(worker_loop(transport, policy, event_bus, rx, worker_stats));
    (SerialEngineHandle { sender: tx, stats }, join)
}

async fn worker_loop(
    mut transport: Box<dyn BmsTransport>,
    policy: RetryPolicy,
    event_bus: Arc<EventBus>,
    mut requests: mpsc::Receiver<EngineRequest>,
    stats: Arc<SerialStats>,
) {
    while let Some(req) = requests.recv().await {
        stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        let result = execute_with_retry(&mut *transport, &policy, &req.kind, &stats).await;

        match &result {
            Ok(_) => {
                stats.responses_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(SerialError::Timeout { .. }) => event_bus.publish(Event::SerialTimeout).await,
            Err(SerialError::CrcMismatch { .. }) => event_bus.publish(Event::SerialCrcMismatch).await,
            Err(SerialError::Nack(code)) => event_bus.publish(Event::SerialNack(*code)).await,
            Err(_) => {}
        }
        event_bus.publish(Event::StatsUpdated(stats.snapshot())).await;

        let _ = req.respond_to.send(result);
    }
    debug!("serial engine worker exiting: request channel closed");
}

fn build_request_frame(kind: &RequestKind) -> Result<Frame, SerialError> {
    Ok(match kind {
        RequestKind::ReadRegister { addr } => commands::build_read_frame(*addr),
        RequestKind::WriteRegister { addr, value } => commands::build_write_frame(*addr, *value),
        RequestKind::Reset => commands::build_reset_frame(),
        RequestKind::BlockRead { start_addr, count } => commands::build_block_read_frame(*start_addr, *count)?,
        RequestKind::BlockWrite { start_addr, values } => commands::build_block_write_frame(*start_addr, values)?,
        RequestKind::RegisterFileRead { start_addr, quantity } => {
            commands::build_register_file_read_frame(*start_addr, *quantity)
        }
        RequestKind::RegisterFileWrite { start_addr, values } => {
            commands::build_register_file_write_frame(*start_addr, values)
        }
        RequestKind::StatusQuery { kind } => commands::build_status_query_frame(*kind),
    })
}

fn parse_response_frame(kind: &RequestKind, frame: &Frame) -> Result<ResponseKind, SerialError> {
    Ok(match kind {
        RequestKind::ReadRegister { .. } => {
            let (addr, value) = commands::parse_read_response(frame)?;
            ResponseKind::Read { addr, value }
        }
        RequestKind::WriteRegister { .. } => {
            ack_or_error(frame)?;
            ResponseKind::Write
        }
        RequestKind::Reset => {
            ack_or_error(frame)?;
            ResponseKind::Reset
        }
        RequestKind::BlockRead { count, .. } => ResponseKind::BlockRead(commands::parse_block_read_response(frame, *count)?),
        RequestKind::BlockWrite { .. } => {
            ack_or_error(frame)?;
            ResponseKind::BlockWrite
        }
        RequestKind::RegisterFileRead { quantity, .. } => {
            ResponseKind::RegisterFileRead(commands::parse_register_file_read_response(frame, *quantity)?)
        }
        RequestKind::RegisterFileWrite { .. } => {
            ack_or_error(frame)?;
            ResponseKind::RegisterFileWrite
        }
        RequestKind::StatusQuery { kind } => ResponseKind::StatusQuery(commands::decode_status_response(*kind, frame)?),
    })
}

fn ack_or_error(frame: &Frame) -> Result<(), SerialError> {
    match commands::parse_ack(frame)? {
        AckOutcome::Ack { .. } => Ok(()),
        AckOutcome::Nack { error, .. } => Err(SerialError::Nack(error)),
    }
}

/// Reads from `transport` into `buffer`, repeatedly, until either a
/// complete frame is extracted or `timeout` elapses. A CRC error on a
/// complete frame-shaped span discards the whole buffer, reported as
/// `SerialError::CrcMismatch` for this attempt only — the retry loop
/// above decides whether to try again.
async fn read_one_frame(
    transport: &mut dyn BmsTransport,
    timeout: Duration,
) -> Result<Frame, SerialError> {
    let mut buffer = Vec::with_capacity(64);
    let mut chunk = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(SerialError::Timeout { attempts: 1 });
        }

        let read_result = tokio::time::timeout(remaining, transport.read(&mut chunk, remaining)).await;
        let n = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(SerialError::Io(e.to_string())),
            Err(_) => return Err(SerialError::Timeout { attempts: 1 }),
        };

        if n == 0 {
            continue;
        }
        buffer.extend_from_slice(&chunk[..n]);

        match extract_frame(&buffer) {
            ExtractResult::Complete { frame, .. } => return Ok(frame),
            ExtractResult::NeedMoreData => continue,
            ExtractResult::CrcError => return Err(SerialError::CrcMismatch { attempts: 1 }),
        }
    }
}

async fn execute_with_retry(
    transport: &mut dyn BmsTransport,
    policy: &RetryPolicy,
    kind: &RequestKind,
    stats: &SerialStats,
) -> Result<ResponseKind, SerialError> {
    let frame = build_request_frame(kind)?;
    let wire = frame.to_bytes();

    let mut last_err = SerialError::Timeout { attempts: 0 };
    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(policy.backoff).await;
        }

        if let Err(e) = transport.write_all(&wire).await {
            last_err = SerialError::Io(e.to_string());
            continue;
        }

        match read_one_frame(transport, policy.per_attempt_timeout).await {
            Ok(response_frame) => match parse_response_frame(kind, &response_frame) {
                Ok(response) => {
                    return finish_write_verify(transport, policy, kind, response, stats).await;
                }
                Err(SerialError::Nack(code)) => {
                    stats.nacks.fetch_add(1, Ordering::Relaxed);
                    return Err(SerialError::Nack(code));
                }
                Err(e) => {
                    last_err = e;
                    continue;
                }
            },
            Err(SerialError::CrcMismatch { .. }) => {
                stats.crc_errors.fetch_add(1, Ordering::Relaxed);
                last_err = SerialError::CrcMismatch { attempts: attempt };
            }
            Err(SerialError::Timeout { .. }) => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                last_err = SerialError::Timeout { attempts: attempt };
            }
            Err(e) => {
                last_err = e;
            }
        }
    }

    warn!("serial request exhausted {} attempt(s): {last_err}", policy.max_attempts);
    Err(last_err)
}

/// After a successful write-family response, re-reads the target register(s)
/// once the link has settled to confirm the write actually landed. Reads and
/// status queries pass through unchanged.
async fn finish_write_verify(
    transport: &mut dyn BmsTransport,
    policy: &RetryPolicy,
    kind: &RequestKind,
    response: ResponseKind,
    stats: &SerialStats,
) -> Result<ResponseKind, SerialError> {
    let RequestKind::WriteRegister { addr, value } = kind else {
        return Ok(response);
    };

    tokio::time::sleep(policy.write_settle).await;

    let verify_frame = commands::build_read_frame(*addr);
    transport.write_all(&verify_frame.to_bytes()).await.map_err(|e| SerialError::Io(e.to_string()))?;
    let readback = read_one_frame(transport, policy.per_attempt_timeout).await?;
    let (_, read_value) = commands::parse_read_response(&readback)?;

    if read_value != *value {
        stats.write_verify_failures.fetch_add(1, Ordering::Relaxed);
        return Err(SerialError::WriteVerifyMismatch {
            wrote: *value,
            read_back: read_value,
        });
    }

    Ok(response)
}
