//! Stratum v1 client.
//!
//! Connecting subscribes and authorizes before returning, so a
//! [`StratumV1Client`] value is always a live, authorized session. After
//! that [`StratumV1Client::run`] forwards complete work templates to the
//! miner and submits validated shares back.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::error::{StratumError, StratumResult};
use super::messages::{parse_difficulty, JobNotification, JsonRpcMessage, Subscription, SubmitParams};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, Notification, ValidatedWork};

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    pub username: String,

    pub password: String,

    /// How long to wait for the response to any one request
    pub timeout: Duration,
}

impl PoolConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: "x".to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Client lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session is up and work is flowing
    Connected,
    /// The session ended, cleanly or not
    Disconnected,
    /// The session failed; followed by `Disconnected`
    Error(String),
}

/// Joins pool pushes and session state into complete [`Notification`]s.
///
/// A notification is only produced once the session has been subscribed and
/// authorized and the pool has sent both a difficulty and a job. Producing
/// one consumes the pending job: a later difficulty change alone does not
/// repeat it, a later job does.
#[derive(Debug, Default)]
pub struct NotificationAssembler {
    subscription: Option<Subscription>,
    authorized: bool,
    difficulty: Option<Difficulty>,
    pending: Option<JobNotification>,
}

impl NotificationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subscription(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    pub fn set_authorized(&mut self) {
        self.authorized = true;
    }

    pub fn set_difficulty(&mut self, difficulty: Difficulty) {
        self.difficulty = Some(difficulty);
    }

    /// Replace the pending job.
    pub fn set_job(&mut self, job: JobNotification) {
        if let Some(replaced) = self.pending.replace(job) {
            trace!(job_id = %replaced.job_id, "Pending job replaced before it was ready");
        }
    }

    pub fn difficulty(&self) -> Option<Difficulty> {
        self.difficulty
    }

    /// Take the pending job as a complete notification, if everything it
    /// needs has arrived.
    pub fn take_ready(&mut self) -> Option<Notification> {
        if !self.authorized {
            return None;
        }
        let subscription = self.subscription.as_ref()?;
        let difficulty = self.difficulty?;
        let job = self.pending.take()?;

        Some(Notification {
            job_id: job.job_id,
            prev_blockhash: job.prev_blockhash,
            coinbase1: job.coinbase1,
            coinbase2: job.coinbase2,
            merkle_branches: job.merkle_branches,
            version: job.version,
            bits: job.bits,
            ntime: job.ntime,
            clean_jobs: job.clean_jobs,
            extranonce1: subscription.extranonce1.clone(),
            extranonce2_size: subscription.extranonce2_size,
            difficulty,
        })
    }
}

/// An authorized Stratum v1 session.
///
/// Pool pushes that arrive while a request is waiting for its response are
/// handled inline, so no message is lost to request/response interleaving.
pub struct StratumV1Client {
    config: PoolConfig,
    conn: Connection,
    next_id: u64,
    assembler: NotificationAssembler,

    /// Assembled notifications not yet handed to the miner
    ready: VecDeque<Notification>,

    events: broadcast::Sender<ClientEvent>,
}

impl StratumV1Client {
    /// Connect, subscribe and authorize.
    ///
    /// Any failure drops the connection and is returned.
    pub async fn connect(config: PoolConfig) -> StratumResult<Self> {
        let conn = Connection::connect(&config.url).await?;
        Self::handshake(config, conn).await
    }

    /// Subscribe and authorize over an already open connection.
    pub async fn handshake(config: PoolConfig, conn: Connection) -> StratumResult<Self> {
        let (events, _) = broadcast::channel(16);
        let mut client = Self {
            config,
            conn,
            next_id: 1,
            assembler: NotificationAssembler::new(),
            ready: VecDeque::new(),
            events,
        };

        info!("Subscribing to pool");
        client.subscribe().await?;

        info!(username = %client.config.username, "Authorizing");
        client.authorize().await?;
        info!("Authorized");

        Ok(client)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// Returns the response's `(result, error)` pair. Gives up with
    /// [`StratumError::Timeout`] after the configured timeout.
    async fn send_request(
        &mut self,
        method: &str,
        params: Value,
    ) -> StratumResult<(Option<Value>, Option<Value>)> {
        let id = self.next_id();
        let limit = self.config.timeout;

        self.conn
            .write_message(&JsonRpcMessage::request(id, method, params))
            .await?;

        timeout(limit, self.read_response(id)).await.map_err(|_| {
            warn!(method, id, "Request timed out");
            StratumError::Timeout
        })?
    }

    /// Read until the response to request `id` arrives, applying any pool
    /// pushes along the way.
    async fn read_response(&mut self, id: u64) -> StratumResult<(Option<Value>, Option<Value>)> {
        loop {
            let msg = self
                .conn
                .read_message()
                .await?
                .ok_or(StratumError::Disconnected)?;

            match msg {
                JsonRpcMessage::Response {
                    id: resp_id,
                    result,
                    error,
                } if resp_id == Some(id) => return Ok((result, error)),
                // Only one request is ever outstanding, so an error the pool
                // could not tie to an id is the answer to this one
                JsonRpcMessage::Response {
                    id: None,
                    result,
                    error: Some(error),
                } => return Ok((result, Some(error))),
                JsonRpcMessage::Response { id: other_id, .. } => {
                    warn!(msg_id = ?other_id, expected = id, "Response for another request");
                }
                JsonRpcMessage::Request {
                    id: None,
                    method,
                    params,
                } => self.handle_push(&method, &params)?,
                JsonRpcMessage::Request {
                    id: Some(_),
                    method,
                    ..
                } => {
                    warn!(method = %method, "Pool sent a request, ignoring");
                }
            }
        }
    }

    async fn subscribe(&mut self) -> StratumResult<()> {
        match self.send_request("mining.subscribe", json!([])).await? {
            (Some(result), None) => {
                let subscription =
                    Subscription::from_result(&result).map_err(StratumError::SubscriptionFailed)?;
                debug!(
                    extranonce1 = %hex::encode(&subscription.extranonce1),
                    extranonce2_size = subscription.extranonce2_size,
                    "Subscribed"
                );
                self.assembler.set_subscription(subscription);
                Ok(())
            }
            (_, Some(error)) => Err(StratumError::SubscriptionFailed(error.to_string())),
            (None, None) => Err(StratumError::UnexpectedResponse(
                "empty subscribe response".to_string(),
            )),
        }
    }

    async fn authorize(&mut self) -> StratumResult<()> {
        let params = json!([&self.config.username, &self.config.password]);
        match self.send_request("mining.authorize", params).await? {
            (Some(Value::Bool(true)), None) => {
                self.assembler.set_authorized();
                self.collect_ready();
                Ok(())
            }
            (_, Some(error)) => Err(StratumError::AuthorizationFailed(error.to_string())),
            (result, None) => Err(StratumError::AuthorizationFailed(format!(
                "pool returned {}",
                result.unwrap_or(Value::Null)
            ))),
        }
    }

    /// Submit every nonce in `work`, one `mining.submit` at a time.
    ///
    /// Any rejection ends the session.
    pub async fn submit(&mut self, work: &ValidatedWork) -> StratumResult<()> {
        for &nonce in &work.submission.nonces {
            let params = SubmitParams {
                username: self.config.username.clone(),
                job_id: work.notification.job_id.clone(),
                extranonce2: work.job.extranonce2.clone(),
                ntime: work.job.header.time,
                nonce,
            };

            debug!(job_id = %params.job_id, %nonce, "Submitting share");
            match self
                .send_request("mining.submit", params.to_stratum_json())
                .await?
            {
                (Some(Value::Bool(true)), None) => {
                    info!(job_id = %params.job_id, %nonce, "Share accepted");
                }
                (_, Some(error)) => {
                    warn!(job_id = %params.job_id, %nonce, error = %error, "Share rejected");
                    return Err(StratumError::SubmissionRejected(error.to_string()));
                }
                (result, None) => {
                    let result = result.unwrap_or(Value::Null);
                    warn!(job_id = %params.job_id, %nonce, %result, "Share rejected");
                    return Err(StratumError::SubmissionRejected(format!(
                        "pool returned {}",
                        result
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply a pool push.
    ///
    /// Malformed pushes are logged and skipped; only a reconnect request
    /// ends the session.
    fn handle_push(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            "mining.set_difficulty" => match parse_difficulty(params) {
                Ok(difficulty) => {
                    debug!(%difficulty, "Difficulty set");
                    self.assembler.set_difficulty(difficulty);
                }
                Err(e) => warn!(error = %e, "Ignoring bad mining.set_difficulty"),
            },
            "mining.notify" => {
                let parsed = params
                    .as_array()
                    .ok_or_else(|| "params not an array".to_string())
                    .and_then(|arr| JobNotification::from_stratum_params(arr));
                match parsed {
                    Ok(job) => {
                        debug!(job_id = %job.job_id, clean_jobs = job.clean_jobs, "New job");
                        self.assembler.set_job(job);
                    }
                    Err(e) => warn!(error = %e, "Ignoring bad mining.notify"),
                }
            }
            "client.reconnect" => {
                info!("Pool requested reconnect");
                return Err(StratumError::Disconnected);
            }
            _ => {
                debug!(method = %method, "Ignoring unknown pool push");
            }
        }

        self.collect_ready();
        Ok(())
    }

    fn collect_ready(&mut self) {
        if let Some(notification) = self.assembler.take_ready() {
            self.ready.push_back(notification);
        }
    }

    /// Run the session until the pool hangs up, something fails, the
    /// submission channel closes or `shutdown` fires.
    ///
    /// Complete work templates go to `notifications`. Every
    /// [`ValidatedWork`] received on `submissions` is submitted in order.
    pub async fn run(
        mut self,
        notifications: mpsc::Sender<Notification>,
        mut submissions: mpsc::Receiver<ValidatedWork>,
        shutdown: CancellationToken,
    ) -> StratumResult<()> {
        let _ = self.events.send(ClientEvent::Connected);

        let result = self
            .serve(&notifications, &mut submissions, &shutdown)
            .await;
        if let Err(e) = &result {
            error!(error = %e, "Stratum session failed");
            let _ = self.events.send(ClientEvent::Error(e.to_string()));
        }

        let _ = self.events.send(ClientEvent::Disconnected);
        result
    }

    async fn serve(
        &mut self,
        notifications: &mpsc::Sender<Notification>,
        submissions: &mut mpsc::Receiver<ValidatedWork>,
        shutdown: &CancellationToken,
    ) -> StratumResult<()> {
        loop {
            while let Some(notification) = self.ready.pop_front() {
                if notifications.send(notification).await.is_err() {
                    debug!("Notification receiver dropped");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }

                msg = self.conn.read_message() => match msg? {
                    Some(JsonRpcMessage::Request { id: None, method, params }) => {
                        self.handle_push(&method, &params)?;
                    }
                    Some(JsonRpcMessage::Response { id, error: Some(error), .. }) => {
                        warn!(msg_id = ?id, %error, "Pool error outside any request");
                    }
                    Some(JsonRpcMessage::Response { id, .. }) => {
                        debug!(msg_id = ?id, "Stray response");
                    }
                    Some(JsonRpcMessage::Request { id: Some(_), method, .. }) => {
                        warn!(method = %method, "Pool sent a request, ignoring");
                    }
                    None => {
                        info!("Connection closed by pool");
                        return Err(StratumError::Disconnected);
                    }
                },

                work = submissions.recv() => match work {
                    Some(work) => self.submit(&work).await?,
                    None => {
                        debug!("Submission channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}
