//! BM1380 chain driver.
//!
//! A [`Chain`] owns the serial link to a string of BM1380 chips. Opening it
//! programs the clock, counts the chips and measures the chain's hashrate;
//! afterwards jobs go in through [`Chain::submit`] and jobs that produced
//! nonces come back out of [`Chain::take_results`].
//!
//! Three pieces cooperate:
//!
//! - A reader task decodes every 5-byte frame from the chips and broadcasts
//!   it. Each operation that cares about responses subscribes for exactly as
//!   long as it runs.
//! - The serial writer lives inside a [`Mutex`]. Any sequence of commands
//!   and the responses to them holds the lock for its whole duration, so a
//!   register read never interleaves with job traffic.
//! - A scheduler task runs while jobs are queued. It holds the lock for its
//!   entire run, sends one job per timeout period, and matches nonces to the
//!   two jobs the chips may still be reporting on.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{sink::Sink, stream::Stream, SinkExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tokio_serial::SerialPortBuilderExt;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::error::ChainError;
use super::protocol::{
    Command, FrameCodec, Frequency, JobFrame, RegisterAddress, Response, BAUD_RATE, SLOT_MASK,
};
use crate::sync::{Fifo, Mutex};
use crate::tracing::prelude::*;
use crate::types::{HashRate, MinedWork, MiningResult, Nonce, Work};

/// Jobs buffered ahead of the scheduler before `submit` waits.
const JOB_QUEUE_DEPTH: usize = 32;

/// How long every chip gets to answer a broadcast command.
const COMMAND_WINDOW: Duration = Duration::from_millis(100);

/// PLL settling time after a clock change.
const PLL_SETTLE: Duration = Duration::from_millis(500);

/// How long to watch for calibration nonces.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(4000);

/// Fraction of a full nonce sweep to let each job run. Replacing work just
/// before the chips exhaust the nonce space keeps them from idling.
const TIMEOUT_FRACTION: f64 = 0.9;

/// Calibration job: a header with two valid nonces in its search space, so
/// each chip reports it twice.
const CALIBRATION_FRAME: [u8; 64] = [
    0x46, 0x79, 0xba, 0x4e, 0xc9, 0x98, 0x76, 0xbf, 0x4b, 0xfe, 0x08, 0x60, 0x82, 0xb4, 0x00, 0x25,
    0x4d, 0xf6, 0xc3, 0x56, 0x45, 0x14, 0x71, 0x13, 0x9a, 0x3a, 0xfa, 0x71, 0xe4, 0x8f, 0x54, 0x4a,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x87, 0x32, 0x0b, 0x1a, 0x14, 0x26, 0x67, 0x4f, 0x2f, 0xa7, 0x22, 0xce,
];

/// The nonce the chips report for [`CALIBRATION_FRAME`] (wire bytes
/// `00 01 87 a2`).
const CALIBRATION_NONCE: u32 = 0xa287_0100;

/// Chain settings.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Serial device path
    pub port: String,

    /// Core clock in MHz; must be in the chip's PLL table
    pub frequency_mhz: u32,

    /// How long each job runs before the next replaces it. Derived from the
    /// calibrated hashrate when `None`.
    pub timeout: Option<Duration>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            frequency_mhz: Frequency::DEFAULT_MHZ,
            timeout: None,
        }
    }
}

/// Lifecycle notifications. A successful [`Chain::open`] is the open event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// The scheduler picked up work
    Started,
    /// The job queue ran dry and the scheduler released the chain
    Stopped,
    /// The serial link is gone; every later `submit` fails
    Closed,
    /// The link failed; always followed by `Closed`
    Error(String),
}

type CommandSink = Pin<Box<dyn Sink<Command, Error = io::Error> + Send>>;

/// Write side of the serial link.
struct Link {
    writer: Option<CommandSink>,
}

impl Link {
    async fn send(&mut self, command: Command) -> Result<(), ChainError> {
        let writer = self.writer.as_mut().ok_or(ChainError::Closed)?;
        writer.send(command).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChainError> {
        match self.writer.take() {
            Some(mut writer) => Ok(writer.close().await?),
            None => Ok(()),
        }
    }
}

/// Open/closed state shared with the reader task.
struct LinkState {
    open: AtomicBool,
    events: broadcast::Sender<ChainEvent>,
}

impl LinkState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the link closed, reporting it once no matter who notices first.
    fn close(&self, error: Option<String>) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Some(error) = error {
                let _ = self.events.send(ChainEvent::Error(error));
            }
            let _ = self.events.send(ChainEvent::Closed);
        }
    }
}

/// Everything needed to talk to the chips: the locked writer, the response
/// fan-out and the work counter used for slot ids.
struct Bus {
    link: Mutex<Link>,
    responses: broadcast::Sender<Response>,
    state: Arc<LinkState>,
    work_count: AtomicU32,
}

impl Bus {
    /// Send a broadcast command and collect every checksum-valid answer that
    /// arrives within [`COMMAND_WINDOW`].
    async fn exchange(&self, command: Command) -> Result<Vec<Response>, ChainError> {
        let mut link = self.link.lock().await;
        self.exchange_locked(&mut link, command).await
    }

    async fn exchange_locked(
        &self,
        link: &mut Link,
        command: Command,
    ) -> Result<Vec<Response>, ChainError> {
        let mut rx = self.responses.subscribe();
        link.send(command).await?;

        let mut answers = Vec::new();
        listen(&mut rx, Instant::now() + COMMAND_WINDOW, |response| {
            if response.is_crc_valid() {
                answers.push(response);
            } else {
                trace!(?response, "Dropping response with bad CRC");
            }
        })
        .await;
        Ok(answers)
    }

    async fn set_frequency(&self, frequency: Frequency) -> Result<(), ChainError> {
        let mut link = self.link.lock().await;
        self.exchange_locked(&mut link, Command::SetPll(frequency))
            .await?;
        tokio::time::sleep(PLL_SETTLE).await;
        // Reading back a register after the change helps the PLL settle
        self.exchange_locked(&mut link, Command::ReadRegister(RegisterAddress::Pll))
            .await?;
        Ok(())
    }

    /// Addresses of every chip that answered a status read.
    async fn chip_addresses(&self) -> Result<Vec<u8>, ChainError> {
        let answers = self
            .exchange(Command::ReadRegister(RegisterAddress::ChipStatus))
            .await?;
        Ok(answers.iter().map(Response::chip_address).collect())
    }

    /// Measure the chain's hashrate from the spacing of calibration nonces.
    async fn calibrate(&self) -> Result<HashRate, ChainError> {
        let mut link = self.link.lock().await;
        let mut rx = self.responses.subscribe();

        // Complement of the counter, so the slot can't collide with real work
        let slot = !self.work_count.load(Ordering::Relaxed) & SLOT_MASK;
        let frame = JobFrame::from_bytes(CALIBRATION_FRAME).with_slot(slot);
        link.send(Command::Job(frame)).await?;

        let mut seen = Vec::new();
        listen(&mut rx, Instant::now() + CALIBRATION_WINDOW, |response| {
            if u32::from(response.slot()) == slot && response.nonce() == CALIBRATION_NONCE {
                seen.push(Instant::now());
            }
        })
        .await;

        let fastest = seen
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|delta| !delta.is_zero())
            .min()
            .ok_or(ChainError::Calibration {
                responses: seen.len(),
            })?;

        let hashes = u32::MAX as f64 + 1.0;
        Ok(HashRate(hashes / fastest.as_secs_f64()))
    }
}

/// Feed responses to `on_response` until `deadline`.
async fn listen(
    rx: &mut broadcast::Receiver<Response>,
    deadline: Instant,
    mut on_response: impl FnMut(Response),
) {
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            received = rx.recv() => match received {
                Ok(response) => on_response(response),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Response listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// A job on the chips, with the nonces reported for it so far.
struct InFlight {
    work_id: u32,
    work: Work,
    result: MiningResult,
}

impl InFlight {
    fn matches(&self, slot: u8) -> bool {
        self.work_id & SLOT_MASK == u32::from(slot)
    }

    fn into_mined(self) -> MinedWork {
        MinedWork {
            notification: self.work.notification,
            job: self.work.job,
            result: self.result,
        }
    }
}

/// Credit a nonce response to the previous or current job, or drop it.
fn correlate(previous: &mut Option<InFlight>, current: &mut Option<InFlight>, response: Response) {
    let slot = response.slot();
    let nonce = Nonce(response.nonce());

    let job = match (previous.as_mut(), current.as_mut()) {
        (Some(prev), _) if prev.matches(slot) => prev,
        (_, Some(curr)) if curr.matches(slot) => curr,
        _ => {
            trace!(slot, %nonce, "Orphaned nonce");
            return;
        }
    };

    if job.result.record(nonce) {
        debug!(slot, %nonce, job_id = %job.work.notification.job_id, "Nonce");
    }
}

struct Shared {
    bus: Bus,
    jobs: Fifo<Work>,
    running: AtomicBool,
    chain_length: usize,
    hash_rate: HashRate,
    timeout: Duration,
    results: mpsc::Sender<MinedWork>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Start the scheduler unless it is already running.
    fn ensure_scheduler(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).scheduler());
        }
    }

    async fn scheduler(self: Arc<Self>) {
        loop {
            self.schedule_until_empty().await;

            self.running.store(false, Ordering::Release);
            let _ = self.bus.state.events.send(ChainEvent::Stopped);
            debug!("Scheduler stopped");

            // A job enqueued after the last dequeue but before `running`
            // cleared would otherwise sit in the queue until the next submit
            if self.jobs.is_empty()
                || self
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
    }

    async fn schedule_until_empty(&self) {
        let mut link = self.bus.link.lock().await;
        let mut rx = self.bus.responses.subscribe();

        let _ = self.bus.state.events.send(ChainEvent::Started);
        debug!(queued = self.jobs.len(), "Scheduler started");

        let mut previous: Option<InFlight> = None;
        let mut current: Option<InFlight> = None;

        loop {
            if let Some(done) = previous.take() {
                self.emit(done).await;
            }
            previous = current.take();

            let Some(work) = self.jobs.try_dequeue() else {
                break;
            };

            let work_id = self.bus.work_count.fetch_add(1, Ordering::Relaxed);
            let frame = JobFrame::from_job(&work.job, work_id);
            if let Err(e) = link.send(Command::Job(frame)).await {
                error!(error = %e, "Failed to send job to chain");
                let discarded = self.jobs.flush();
                debug!(discarded, "Discarded queued jobs");
                break;
            }
            trace!(
                work_id,
                job_id = %work.notification.job_id,
                extranonce2 = %work.job.extranonce2_hex(),
                "Job sent"
            );

            current = Some(InFlight {
                work_id,
                work,
                result: MiningResult::new(),
            });

            listen(&mut rx, Instant::now() + self.timeout, |response| {
                correlate(&mut previous, &mut current, response)
            })
            .await;
        }

        // Pick up anything that arrived after the last timeout fired
        while let Ok(response) = rx.try_recv() {
            correlate(&mut previous, &mut current, response);
        }
        if let Some(done) = previous.take() {
            self.emit(done).await;
        }
    }

    async fn emit(&self, job: InFlight) {
        if job.result.is_empty() {
            return;
        }
        if job.result.dropped() > 0 {
            debug!(
                work_id = job.work_id,
                kept = job.result.nonces().len(),
                dropped = job.result.dropped(),
                "Job reported more nonces than kept"
            );
        }
        if self.results.send(job.into_mined()).await.is_err() {
            debug!("Result receiver dropped, discarding mined work");
        }
    }
}

/// Reader task: decode frames and fan them out until the link closes.
async fn read_responses<R>(
    mut reader: R,
    responses: broadcast::Sender<Response>,
    state: Arc<LinkState>,
    shutdown: CancellationToken,
) where
    R: Stream<Item = Result<Response, io::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            item = reader.next() => match item {
                Some(Ok(response)) => {
                    // No subscribers just means nobody is listening right now
                    let _ = responses.send(response);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Serial read failed");
                    state.close(Some(e.to_string()));
                    break;
                }
                None => {
                    info!("Serial link closed");
                    state.close(None);
                    break;
                }
            },
        }
    }
    trace!("Response reader exiting");
}

/// An initialized BM1380 chain.
pub struct Chain {
    shared: Arc<Shared>,
    results: Option<mpsc::Receiver<MinedWork>>,
}

impl Chain {
    /// Open the serial port and bring the chain up.
    pub async fn open(config: &ChainConfig) -> Result<Self, ChainError> {
        let port = tokio_serial::new(&config.port, BAUD_RATE).open_native_async()?;
        let (reader, writer) = tokio::io::split(port);

        info!(port = %config.port, "Opened serial port");
        Self::open_with(
            FramedRead::new(reader, FrameCodec),
            FramedWrite::new(writer, FrameCodec),
            config,
        )
        .await
    }

    /// Bring up a chain over an arbitrary response stream and command sink.
    ///
    /// Runs the full initialization: clock, chip count, calibration. On any
    /// failure the link is dropped and the error returned; a `Chain` only
    /// ever exists fully initialized.
    pub async fn open_with<R, W>(
        responses: R,
        commands: W,
        config: &ChainConfig,
    ) -> Result<Self, ChainError>
    where
        R: Stream<Item = Result<Response, io::Error>> + Unpin + Send + 'static,
        W: Sink<Command> + Send + 'static,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(16);
        let (response_tx, _) = broadcast::channel(256);
        let state = Arc::new(LinkState {
            open: AtomicBool::new(true),
            events,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(read_responses(
            responses,
            response_tx.clone(),
            Arc::clone(&state),
            shutdown.clone(),
        ));

        let writer: CommandSink = Box::pin(commands.sink_map_err(io::Error::other));
        let bus = Bus {
            link: Mutex::new(Link {
                writer: Some(writer),
            }),
            responses: response_tx,
            state,
            work_count: AtomicU32::new(0),
        };

        match initialize(&bus, config).await {
            Ok((chain_length, hash_rate, timeout)) => {
                let (results_tx, results_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
                let shared = Arc::new(Shared {
                    bus,
                    jobs: Fifo::bounded(JOB_QUEUE_DEPTH),
                    running: AtomicBool::new(false),
                    chain_length,
                    hash_rate,
                    timeout,
                    results: results_tx,
                    shutdown,
                });
                Ok(Self {
                    shared,
                    results: Some(results_rx),
                })
            }
            Err(e) => {
                error!(error = %e, "Chain initialization failed");
                shutdown.cancel();
                let _ = bus.link.lock().await.close().await;
                Err(e)
            }
        }
    }

    /// Queue a job for the chips.
    ///
    /// Waits while the queue is full. Fails at once if the link is closed.
    pub async fn submit(&self, work: Work) -> Result<(), ChainError> {
        if !self.shared.bus.state.is_open() {
            return Err(ChainError::Closed);
        }
        self.shared.jobs.enqueue(work).await;
        self.shared.ensure_scheduler();
        Ok(())
    }

    /// Drop every queued job that has not been sent yet.
    pub fn flush(&self) -> usize {
        let discarded = self.shared.jobs.flush();
        debug!(discarded, "Flushed job queue");
        discarded
    }

    /// Read a register from every chip, returning each chip's answer.
    pub async fn read_register(&self, register: RegisterAddress) -> Result<Vec<Response>, ChainError> {
        self.shared
            .bus
            .exchange(Command::ReadRegister(register))
            .await
    }

    /// Send the chain-inactive command.
    pub async fn chain_inactive(&self) -> Result<(), ChainError> {
        self.shared.bus.exchange(Command::ChainInactive).await?;
        Ok(())
    }

    /// Close the link.
    ///
    /// Waits for the chain lock, so a running scheduler finishes its queue
    /// first. Afterwards every `submit` fails.
    pub async fn close(&self) -> Result<(), ChainError> {
        let mut link = self.shared.bus.link.lock().await;
        let result = link.close().await;
        self.shared.shutdown.cancel();
        self.shared
            .bus
            .state
            .close(result.as_ref().err().map(ToString::to_string));
        info!("Chain closed");
        result
    }

    /// Jobs that came back with at least one nonce, in the order they ran.
    ///
    /// Returns `None` after the first call.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<MinedWork>> {
        self.results.take()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.shared.bus.state.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared.bus.state.is_open()
    }

    pub fn chain_length(&self) -> usize {
        self.shared.chain_length
    }

    pub fn hash_rate(&self) -> HashRate {
        self.shared.hash_rate
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Jobs sent to the chips so far (wraps at 2^32).
    pub fn work_count(&self) -> u32 {
        self.shared.bus.work_count.load(Ordering::Relaxed)
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn initialize(
    bus: &Bus,
    config: &ChainConfig,
) -> Result<(usize, HashRate, Duration), ChainError> {
    let frequency = Frequency::from_mhz(config.frequency_mhz)?;
    bus.set_frequency(frequency).await?;
    debug!(%frequency, "Clock configured");

    let addresses = bus.chip_addresses().await?;
    if addresses.is_empty() {
        return Err(ChainError::NoChipsDetected);
    }
    info!(chips = addresses.len(), addresses = ?addresses, "Chain detected");

    let hash_rate = bus.calibrate().await?;
    let timeout = config
        .timeout
        .unwrap_or_else(|| hash_rate.nonce_space_duration().mul_f64(TIMEOUT_FRACTION));
    info!(%hash_rate, timeout_ms = timeout.as_millis() as u64, "Chain calibrated");

    Ok((addresses.len(), hash_rate, timeout))
}
