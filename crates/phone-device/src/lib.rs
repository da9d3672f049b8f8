//! Device transport and runtime for the dialink client.
//!
//! This crate owns everything that touches the network: the WebSocket event
//! stream with reconnect/backoff and polling fallback, the HTTP command
//! client, and the engine pipeline task that exclusively owns all derived
//! state (sequence guard, translator, call lifecycle machine, history
//! ledger, snapshot debouncer).

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, Semaphore, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use phone_core::{
    Admission, AudioUpdate, BlockedNumberEntry, CallDelta, CallMachine, CallRecord, ChannelError,
    ClientChannels,
    ClientEvent, ConnectionState, Delta, DeviceError, DiagnosticsReport, DndUpdate, EngineInput,
    ErrorCategory, EventEnvelope, EventMeta, EventStream, EventTranslator, HistoryFilter,
    HistoryLedger, PhoneState, QuickDialEntry, RetryPolicy, RingRequest, SequenceGuard, Snapshot,
    classify_http_status, map_firmware_error_code,
};
use phone_platform::{SnapshotStore, SnapshotStoreError};

const DEFAULT_PORT: u16 = 8080;
const WEBSOCKET_PATH: &str = "/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SNAPSHOT_DEBOUNCE: Duration = Duration::from_secs(5);
/// Consecutive connect failures before polling substitutes for the stream.
const DEGRADED_FAILURE_THRESHOLD: u32 = 3;
/// Full resyncs are issued at most once per this interval.
const RESYNC_MIN_INTERVAL: Duration = Duration::from_secs(10);
/// One rate-limiting gate per device; commands never queue deeper than this.
const COMMAND_CONCURRENCY_LIMIT: usize = 4;
/// Raw envelopes retained for diagnostics.
const RECENT_EVENT_BUFFER: usize = 300;

const API_CONFIG: &str = "/api/config";
const API_REFETCH_ALL: &str = "/api/refetch_all";
const API_DIAGNOSTICS: &str = "/api/diagnostics";
const API_CALL_DIAL: &str = "/api/call/dial";
const API_CALL_DIAL_DIGIT: &str = "/api/call/dial_digit";
const API_CALL_ANSWER: &str = "/api/call/answer";
const API_CALL_HANGUP: &str = "/api/call/hangup";
const API_SYSTEM_RESET: &str = "/api/system/reset";
const API_SYSTEM_FACTORY_RESET: &str = "/api/system/factory_reset";
const API_SYSTEM_RING: &str = "/api/system/ring";
const API_CONFIG_DND: &str = "/api/config/dnd";
const API_CONFIG_AUDIO: &str = "/api/config/audio";
const API_CONFIG_RING_PATTERN: &str = "/api/config/ring_pattern";
const API_CONFIG_MAINTENANCE: &str = "/api/config/maintenance";
const API_CONFIG_DIALING: &str = "/api/config/dialing";
const API_CONFIG_QUICK_DIAL_ADD: &str = "/api/config/quick_dial_add";
const API_CONFIG_QUICK_DIAL_REMOVE: &str = "/api/config/quick_dial_remove";
const API_CONFIG_BLOCKED_ADD: &str = "/api/config/blocked_add";
const API_CONFIG_BLOCKED_REMOVE: &str = "/api/config/blocked_remove";
const API_CONFIG_WEBHOOK_ADD: &str = "/api/config/webhook_add";
const API_CONFIG_WEBHOOK_REMOVE: &str = "/api/config/webhook_remove";

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Connection parameters for one device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    /// Stable identity used to key persisted snapshots. Defaults to
    /// `host:port`.
    pub device_id: String,
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let device_id = format!("{host}:{DEFAULT_PORT}");
        Self {
            host,
            port: DEFAULT_PORT,
            device_id,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self.device_id = format!("{}:{port}", self.host);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn base_url(&self) -> Result<Url, DeviceError> {
        Url::parse(&format!("http://{}:{}", self.host, self.port)).map_err(|err| {
            DeviceError::new(
                ErrorCategory::Config,
                "invalid_device_address",
                format!("invalid device address '{}:{}': {err}", self.host, self.port),
            )
        })
    }

    pub fn websocket_url(&self) -> Result<Url, DeviceError> {
        Url::parse(&format!(
            "ws://{}:{}{WEBSOCKET_PATH}",
            self.host, self.port
        ))
        .map_err(|err| {
            DeviceError::new(
                ErrorCategory::Config,
                "invalid_device_address",
                format!("invalid websocket address for '{}': {err}", self.host),
            )
        })
    }
}

/// Runtime tuning knobs; defaults match the device firmware expectations.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub poll_interval: Duration,
    pub liveness_timeout: Duration,
    pub snapshot_debounce: Duration,
    pub history_capacity: usize,
}

impl RuntimeConfig {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            poll_interval: DEFAULT_POLL_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            snapshot_debounce: DEFAULT_SNAPSHOT_DEBOUNCE,
            history_capacity: phone_core::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// HTTP command client for the device's request/response API.
///
/// All outward commands pass through one per-device semaphore so command
/// storms cannot form; a command in flight never blocks event ingestion.
#[derive(Debug)]
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: Url,
    gate: Semaphore,
}

impl DeviceClient {
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                DeviceError::new(
                    ErrorCategory::Internal,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http,
            base_url: config.base_url()?,
            gate: Semaphore::new(COMMAND_CONCURRENCY_LIMIT),
        })
    }

    async fn request(&self, endpoint: &str, body: Option<Value>) -> Result<Value, DeviceError> {
        let _permit = self.gate.acquire().await.map_err(|_| {
            DeviceError::new(
                ErrorCategory::Internal,
                "command_gate_closed",
                "command gate closed during shutdown",
            )
        })?;

        let url = self.base_url.join(endpoint).map_err(|err| {
            DeviceError::new(
                ErrorCategory::Internal,
                "invalid_endpoint",
                format!("invalid endpoint '{endpoint}': {err}"),
            )
        })?;

        debug!(%url, "device command request");
        let request = match &body {
            Some(body) => self.http.post(url).json(body),
            None => self.http.get(url),
        };

        let response = request.send().await.map_err(|err| {
            DeviceError::device_unreachable(format!("device request failed: {err}"))
        })?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.map_err(|err| {
            DeviceError::new(
                ErrorCategory::Protocol,
                "invalid_response",
                format!("device returned invalid JSON: {err}"),
            )
        })?;

        if !(200..300).contains(&status) {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("device returned an error status")
                .to_owned();
            if let Some(code) = payload.get("errorCode").and_then(Value::as_str) {
                return Err(map_firmware_error_code(code, message));
            }
            return Err(DeviceError::new(
                classify_http_status(status),
                "http_error",
                format!("HTTP {status}: {message}"),
            ));
        }

        if !payload.get("success").and_then(Value::as_bool).unwrap_or(true) {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown device error")
                .to_owned();
            let code = payload
                .get("errorCode")
                .and_then(Value::as_str)
                .unwrap_or("");
            return Err(map_firmware_error_code(code, message));
        }

        Ok(payload)
    }

    /// Fetch the full device config/state snapshot (also the polling call).
    pub async fn fetch_config(&self) -> Result<Value, DeviceError> {
        let payload = self.request(API_CONFIG, None).await?;
        Ok(payload.get("data").cloned().unwrap_or(payload))
    }

    /// Ask the device to re-emit its full state over the event stream.
    pub async fn refetch_all(&self) -> Result<(), DeviceError> {
        self.request(API_REFETCH_ALL, None).await.map(|_| ())
    }

    pub async fn fetch_diagnostics(&self) -> Result<Value, DeviceError> {
        self.request(API_DIAGNOSTICS, None).await
    }

    pub async fn dial(&self, number: &str) -> Result<(), DeviceError> {
        if number.trim().is_empty() {
            return Err(DeviceError::invalid_input("number cannot be empty"));
        }
        self.request(API_CALL_DIAL, Some(json!({"number": number})))
            .await
            .map(|_| ())
    }

    pub async fn dial_digit(&self, digit: u8) -> Result<(), DeviceError> {
        if digit > 9 {
            return Err(DeviceError::invalid_input("digit must be between 0 and 9"));
        }
        self.request(API_CALL_DIAL_DIGIT, Some(json!({"digit": digit})))
            .await
            .map(|_| ())
    }

    pub async fn answer(&self) -> Result<(), DeviceError> {
        self.request(API_CALL_ANSWER, Some(json!({}))).await.map(|_| ())
    }

    pub async fn hangup(&self) -> Result<(), DeviceError> {
        self.request(API_CALL_HANGUP, Some(json!({}))).await.map(|_| ())
    }

    pub async fn ring(&self, request: &RingRequest) -> Result<(), DeviceError> {
        self.request(API_SYSTEM_RING, Some(serde_json::to_value(request).map_err(
            |err| DeviceError::new(ErrorCategory::Serialization, "encode_error", err.to_string()),
        )?))
        .await
        .map(|_| ())
    }

    pub async fn reset_device(&self) -> Result<(), DeviceError> {
        self.request(API_SYSTEM_RESET, Some(json!({}))).await.map(|_| ())
    }

    pub async fn factory_reset_device(&self) -> Result<(), DeviceError> {
        self.request(API_SYSTEM_FACTORY_RESET, Some(json!({})))
            .await
            .map(|_| ())
    }

    /// Apply a partial DND update; only provided fields reach the device.
    pub async fn set_dnd(&self, update: &DndUpdate) -> Result<(), DeviceError> {
        self.request(API_CONFIG_DND, Some(encode(update)?)).await.map(|_| ())
    }

    /// Apply a partial audio update; only provided fields reach the device.
    pub async fn set_audio(&self, update: &AudioUpdate) -> Result<(), DeviceError> {
        self.request(API_CONFIG_AUDIO, Some(encode(update)?))
            .await
            .map(|_| ())
    }

    pub async fn set_ring_pattern(&self, pattern: &str) -> Result<(), DeviceError> {
        self.request(API_CONFIG_RING_PATTERN, Some(json!({"pattern": pattern})))
            .await
            .map(|_| ())
    }

    pub async fn set_maintenance_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        self.request(API_CONFIG_MAINTENANCE, Some(json!({"enabled": enabled})))
            .await
            .map(|_| ())
    }

    pub async fn set_dialing_code(&self, default_code: &str) -> Result<(), DeviceError> {
        if default_code.is_empty() || !default_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(DeviceError::invalid_input(
                "default dialing code must contain digits only",
            ));
        }
        self.request(API_CONFIG_DIALING, Some(json!({"defaultCode": default_code})))
            .await
            .map(|_| ())
    }

    pub async fn add_quick_dial(
        &self,
        code: &str,
        number: &str,
        name: &str,
    ) -> Result<(), DeviceError> {
        if code.is_empty() || number.is_empty() {
            return Err(DeviceError::invalid_input(
                "quick dial requires a code and a number",
            ));
        }
        let mut body = json!({"code": code, "number": number});
        if !name.is_empty() {
            body["name"] = name.into();
        }
        self.request(API_CONFIG_QUICK_DIAL_ADD, Some(body)).await.map(|_| ())
    }

    pub async fn remove_quick_dial(&self, code: &str) -> Result<(), DeviceError> {
        self.request(API_CONFIG_QUICK_DIAL_REMOVE, Some(json!({"code": code})))
            .await
            .map(|_| ())
    }

    pub async fn add_blocked_number(&self, number: &str, reason: &str) -> Result<(), DeviceError> {
        if number.is_empty() {
            return Err(DeviceError::invalid_input("number cannot be empty"));
        }
        let mut body = json!({"number": number});
        if !reason.is_empty() {
            body["reason"] = reason.into();
        }
        self.request(API_CONFIG_BLOCKED_ADD, Some(body)).await.map(|_| ())
    }

    pub async fn remove_blocked_number(&self, number: &str) -> Result<(), DeviceError> {
        if number.is_empty() {
            return Err(DeviceError::invalid_input("number cannot be empty"));
        }
        self.request(API_CONFIG_BLOCKED_REMOVE, Some(json!({"number": number})))
            .await
            .map(|_| ())
    }

    pub async fn add_webhook(
        &self,
        code: &str,
        webhook_id: &str,
        action_name: &str,
    ) -> Result<(), DeviceError> {
        if code.is_empty() || webhook_id.is_empty() {
            return Err(DeviceError::invalid_input(
                "webhook requires a code and an id",
            ));
        }
        let mut body = json!({"code": code, "id": webhook_id});
        if !action_name.is_empty() {
            body["actionName"] = action_name.into();
        }
        self.request(API_CONFIG_WEBHOOK_ADD, Some(body)).await.map(|_| ())
    }

    pub async fn remove_webhook(&self, code: &str) -> Result<(), DeviceError> {
        self.request(API_CONFIG_WEBHOOK_REMOVE, Some(json!({"code": code})))
            .await
            .map(|_| ())
    }

    /// Push a batch of quick dial entries, returning how many were accepted.
    pub async fn import_quick_dials(
        &self,
        entries: &[QuickDialEntry],
    ) -> Result<usize, DeviceError> {
        let mut imported = 0;
        for entry in entries {
            self.add_quick_dial(&entry.code, &entry.number, &entry.name)
                .await?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Push a batch of blocked numbers, returning how many were accepted.
    pub async fn import_blocked_numbers(
        &self,
        entries: &[BlockedNumberEntry],
    ) -> Result<usize, DeviceError> {
        let mut imported = 0;
        for entry in entries {
            self.add_blocked_number(&entry.number, &entry.reason).await?;
            imported += 1;
        }
        Ok(imported)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, DeviceError> {
    serde_json::to_value(value).map_err(|err| {
        DeviceError::new(ErrorCategory::Serialization, "encode_error", err.to_string())
    })
}

/// Handle for talking to a spawned device runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    channels: ClientChannels,
    client: Arc<DeviceClient>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RuntimeHandle {
    /// Subscribe to host-facing events.
    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Immutable snapshot of the current derived phone state.
    pub fn phone_state(&self) -> PhoneState {
        self.channels.phone_state()
    }

    /// The outward command client (dial, hangup, config updates...).
    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    /// Export history records matching the filter, newest-first.
    pub async fn history_export(
        &self,
        filter: HistoryFilter,
    ) -> Result<Vec<CallRecord>, ChannelError> {
        self.channels
            .query(|reply| EngineInput::HistoryExport { filter, reply })
            .await
    }

    /// Prune history records, returning how many were removed.
    pub async fn history_clear(&self, filter: HistoryFilter) -> Result<usize, ChannelError> {
        self.channels
            .query(|reply| EngineInput::HistoryClear { filter, reply })
            .await
    }

    /// Diagnostics counters plus the recent raw envelope ring buffer.
    pub async fn diagnostics(&self) -> Result<DiagnosticsReport, ChannelError> {
        self.channels
            .query(|reply| EngineInput::Diagnostics { reply })
            .await
    }

    /// Current quick dial list as mirrored from the device.
    pub fn export_quick_dials(&self) -> Vec<QuickDialEntry> {
        self.phone_state().quick_dials
    }

    /// Current blocked number list as mirrored from the device.
    pub fn export_blocked_numbers(&self) -> Vec<BlockedNumberEntry> {
        self.phone_state().blocked_numbers
    }

    /// Stop the runtime: cancels the supervisor, timers, and engine, and
    /// waits for the final snapshot write.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Spawn the supervisor and engine for one device.
pub fn spawn_runtime(
    config: RuntimeConfig,
    store: Arc<dyn SnapshotStore>,
) -> Result<RuntimeHandle, DeviceError> {
    let client = Arc::new(DeviceClient::new(&config.device)?);
    let websocket_url = config.device.websocket_url()?;
    let (channels, input_rx, state_tx) = ClientChannels::new(256, 512);
    let (resync_tx, resync_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();

    let engine = Engine::new(
        channels.clone(),
        state_tx,
        resync_tx,
        store,
        config.device.device_id.clone(),
        config.history_capacity,
        config.snapshot_debounce,
    );
    let engine_task = tokio::spawn(engine.run(input_rx, cancel.child_token()));

    let supervisor = Supervisor {
        client: client.clone(),
        channels: channels.clone(),
        websocket_url,
        poll_interval: config.poll_interval,
        liveness_timeout: config.liveness_timeout,
        retry: RetryPolicy::default(),
    };
    let supervisor_task = tokio::spawn(supervisor.run(resync_rx, cancel.child_token()));

    Ok(RuntimeHandle {
        channels,
        client,
        cancel,
        tasks: Arc::new(Mutex::new(vec![engine_task, supervisor_task])),
    })
}

/// Reasons the engine asks the supervisor for a full resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncReason {
    Reboot,
    Reconnect,
}

struct Supervisor {
    client: Arc<DeviceClient>,
    channels: ClientChannels,
    websocket_url: Url,
    poll_interval: Duration,
    liveness_timeout: Duration,
    retry: RetryPolicy,
}

impl Supervisor {
    /// Connection loop: connect, stream, reconnect with jittered backoff,
    /// degrade to polling after repeated failures or liveness loss.
    async fn run(self, mut resync_rx: mpsc::Receiver<ResyncReason>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        let mut was_connected = false;
        let mut last_resync: Option<Instant> = None;
        let mut poll_guard: Option<PollGuard> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_connection(ConnectionState::Connecting).await;

            let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.websocket_url.as_str()));
            let session = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect => result,
            };

            match session {
                Ok(Ok((stream, _response))) => {
                    info!(url = %self.websocket_url, "event stream connected");
                    poll_guard.take();

                    self.set_connection(ConnectionState::Connected).await;
                    let _ = self
                        .channels
                        .send_input(EngineInput::EpochReset {
                            resumed: was_connected,
                        })
                        .await;
                    if was_connected {
                        self.maybe_resync(ResyncReason::Reconnect, &mut last_resync)
                            .await;
                    }
                    was_connected = true;

                    let outcome = self
                        .stream_session(stream, &mut attempt, &mut resync_rx, &mut last_resync, &cancel)
                        .await;

                    if cancel.is_cancelled() {
                        break;
                    }
                    if outcome == SessionEnd::LivenessTimeout && poll_guard.is_none() {
                        poll_guard = Some(self.start_polling(&cancel));
                        self.set_connection(ConnectionState::Degraded).await;
                    } else {
                        self.set_connection(ConnectionState::Disconnected).await;
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "event stream connect failed");
                    attempt = attempt.saturating_add(1);
                }
                Err(_) => {
                    warn!("event stream connect timed out");
                    attempt = attempt.saturating_add(1);
                }
            }

            if attempt >= DEGRADED_FAILURE_THRESHOLD && poll_guard.is_none() {
                info!(
                    failures = attempt,
                    "entering degraded mode; polling substitutes for push events"
                );
                poll_guard = Some(self.start_polling(&cancel));
                self.set_connection(ConnectionState::Degraded).await;
            }

            let delay = self.retry.jittered_delay_for_attempt(attempt, None);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        poll_guard.take();
        self.set_connection(ConnectionState::Disconnected).await;
    }

    async fn stream_session(
        &self,
        mut stream: impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
        attempt: &mut u32,
        resync_rx: &mut mpsc::Receiver<ResyncReason>,
        last_resync: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                reason = resync_rx.recv() => {
                    if let Some(reason) = reason {
                        self.maybe_resync(reason, last_resync).await;
                    }
                }
                frame = tokio::time::timeout(self.liveness_timeout, stream.next()) => {
                    match frame {
                        Err(_) => {
                            warn!("event stream silent beyond liveness timeout");
                            return SessionEnd::LivenessTimeout;
                        }
                        Ok(None) => {
                            debug!("event stream closed by device");
                            return SessionEnd::Closed;
                        }
                        Ok(Some(Err(err))) => {
                            warn!(error = %err, "event stream read error");
                            return SessionEnd::Closed;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            // Any successful frame receipt resets backoff to
                            // baseline.
                            *attempt = 0;
                            match parse_frame(&text) {
                                Ok(envelope) => {
                                    if self
                                        .channels
                                        .send_input(EngineInput::Frame(envelope))
                                        .await
                                        .is_err()
                                    {
                                        return SessionEnd::Cancelled;
                                    }
                                }
                                // Protocol fault: drop the frame, keep the
                                // stream alive.
                                Err(err) => warn!(error = %err, "dropping malformed frame"),
                            }
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            debug!("event stream close frame");
                            return SessionEnd::Closed;
                        }
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }

    fn start_polling(&self, cancel: &CancellationToken) -> PollGuard {
        let poll_cancel = cancel.child_token();
        let client = self.client.clone();
        let channels = self.channels.clone();
        let interval = self.poll_interval;
        let stop = poll_cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match client.fetch_config().await {
                            Ok(data) => {
                                let _ = channels
                                    .send_input(EngineInput::PolledSnapshot(data))
                                    .await;
                            }
                            Err(err) => debug!(error = %err, "fallback poll failed"),
                        }
                    }
                }
            }
        });
        PollGuard {
            cancel: poll_cancel,
            task,
        }
    }

    async fn maybe_resync(&self, reason: ResyncReason, last_resync: &mut Option<Instant>) {
        if let Some(at) = last_resync
            && at.elapsed() < RESYNC_MIN_INTERVAL
        {
            debug!(?reason, "resync suppressed by rate limit");
            return;
        }
        *last_resync = Some(Instant::now());

        info!(?reason, "requesting full device resync");
        if let Err(err) = self.client.refetch_all().await {
            warn!(error = %err, "resync request failed");
        }
    }

    async fn set_connection(&self, state: ConnectionState) {
        let _ = self
            .channels
            .send_input(EngineInput::ConnectionChanged(state))
            .await;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    LivenessTimeout,
    Cancelled,
}

/// Cancels its poll task when dropped.
struct PollGuard {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

fn parse_frame(text: &str) -> Result<EventEnvelope, DeviceError> {
    let mut envelope: EventEnvelope = serde_json::from_str(text).map_err(|err| {
        DeviceError::new(
            ErrorCategory::Protocol,
            "malformed_frame",
            format!("frame is not a valid envelope: {err}"),
        )
    })?;
    envelope.received_at = now_ts();
    Ok(envelope)
}

/// Controls the 1 Hz duration ticker spawned while a call is open.
struct TickGuard {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Single sequential owner of all derived state. Every frame, timer tick,
/// polled snapshot, and host query is applied in arrival order.
struct Engine {
    channels: ClientChannels,
    state_tx: watch::Sender<PhoneState>,
    resync_tx: mpsc::Sender<ResyncReason>,
    store: Arc<dyn SnapshotStore>,
    device_id: String,
    guard: SequenceGuard,
    translator: EventTranslator,
    machine: CallMachine,
    ledger: HistoryLedger,
    recent: VecDeque<EventEnvelope>,
    connection: ConnectionState,
    accepted: u64,
    dropped: u64,
    unknown: u64,
    dirty: bool,
    snapshot_debounce: Duration,
    tick: Option<TickGuard>,
}

impl Engine {
    fn new(
        channels: ClientChannels,
        state_tx: watch::Sender<PhoneState>,
        resync_tx: mpsc::Sender<ResyncReason>,
        store: Arc<dyn SnapshotStore>,
        device_id: String,
        history_capacity: usize,
        snapshot_debounce: Duration,
    ) -> Self {
        Self {
            channels,
            state_tx,
            resync_tx,
            store,
            device_id,
            guard: SequenceGuard::new(),
            translator: EventTranslator::new(),
            machine: CallMachine::new(),
            ledger: HistoryLedger::with_capacity(history_capacity),
            recent: VecDeque::new(),
            connection: ConnectionState::Disconnected,
            accepted: 0,
            dropped: 0,
            unknown: 0,
            dirty: false,
            snapshot_debounce,
            tick: None,
        }
    }

    async fn run(mut self, mut input_rx: mpsc::Receiver<EngineInput>, cancel: CancellationToken) {
        self.restore_snapshot();
        self.publish_state();

        let mut debounce = tokio::time::interval(self.snapshot_debounce);
        debounce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = debounce.tick() => {
                    if self.dirty {
                        self.save_snapshot();
                        self.dirty = false;
                    }
                }
                input = input_rx.recv() => {
                    match input {
                        Some(input) => self.handle_input(input),
                        None => break,
                    }
                }
            }
        }

        self.tick.take();
        self.save_snapshot();
    }

    fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Frame(envelope) => self.handle_frame(envelope),
            EngineInput::EpochReset { resumed } => {
                self.guard.reset_epoch();
                self.translator.reset_epoch();
                if resumed {
                    debug!("sequence tracking reset after reconnect");
                }
                if self.machine.set_connected(true) {
                    self.publish_state();
                }
            }
            EngineInput::ConnectionChanged(state) => {
                if self.connection != state {
                    self.connection = state;
                    self.channels.emit(ClientEvent::ConnectionChanged { state });
                }
                let connected = matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Degraded
                );
                if self.machine.set_connected(connected) {
                    self.publish_state();
                }
            }
            EngineInput::PolledSnapshot(data) => {
                if let Some(seq) = self.machine.apply_polled_snapshot(&data) {
                    self.guard.observe_polled_seq(seq);
                }
                self.machine.note_seq(self.guard.tracker().last_seq);
                self.machine.set_connected(true);
                self.dirty = true;
                self.publish_state();
            }
            EngineInput::DurationTick => self.handle_duration_tick(),
            EngineInput::HistoryExport { filter, reply } => {
                let _ = reply.send(self.ledger.export(filter));
            }
            EngineInput::HistoryClear { filter, reply } => {
                let _ = reply.send(self.ledger.prune(filter));
            }
            EngineInput::Diagnostics { reply } => {
                let _ = reply.send(DiagnosticsReport {
                    connection: self.connection,
                    last_seq: self.guard.tracker().last_seq,
                    reboot_detected: self.guard.tracker().reboot_detected,
                    events_accepted: self.accepted,
                    events_dropped: self.dropped,
                    unknown_events: self.unknown,
                    history_len: self.ledger.len(),
                    recent_events: self.recent.iter().cloned().collect(),
                });
            }
        }
    }

    fn handle_frame(&mut self, envelope: EventEnvelope) {
        self.recent.push_back(envelope.clone());
        while self.recent.len() > RECENT_EVENT_BUFFER {
            self.recent.pop_front();
        }

        match self.guard.admit(&envelope) {
            Admission::Stale => {
                self.dropped += 1;
                return;
            }
            Admission::RebootDetected => {
                self.machine.on_reboot();
                self.tick.take();
                self.channels.emit(ClientEvent::RebootDetected);
                if self.resync_tx.try_send(ResyncReason::Reboot).is_err() {
                    debug!("resync request dropped (supervisor busy)");
                }
                // The regressed envelope itself is still applied below.
            }
            Admission::Accepted => {}
        }

        self.accepted += 1;
        self.machine.note_seq(self.guard.tracker().last_seq);
        self.machine.set_connected(true);

        let meta = EventMeta::from_envelope(&envelope);
        match self.translator.translate(&envelope) {
            Delta::Call(delta) => {
                if let CallDelta::Start {
                    number,
                    is_incoming,
                    ..
                } = &delta
                {
                    self.channels.emit(ClientEvent::CallStarted {
                        number: number.clone(),
                        is_incoming: *is_incoming,
                    });
                }
                let records = self.machine.apply_call(&delta, &meta);
                self.finalize_records(records);
                self.sync_ticker();
            }
            Delta::PhoneState(delta) => {
                let records = self.machine.apply_phone_state(&delta, &meta);
                self.finalize_records(records);
                self.sync_ticker();
            }
            Delta::System(delta) => {
                self.machine.apply_system(&delta);
                match &delta {
                    phone_core::SystemDelta::Status { .. } => {
                        let stats = &self.machine.state().stats;
                        self.channels.emit(ClientEvent::SystemStatus {
                            free_heap_bytes: stats.free_heap_bytes,
                            rssi_dbm: stats.rssi_dbm,
                            uptime_seconds: stats.uptime_seconds,
                        });
                    }
                    phone_core::SystemDelta::Error { error } => {
                        self.channels.emit(ClientEvent::SystemError {
                            error: error.clone(),
                        });
                    }
                    phone_core::SystemDelta::Shutdown { reason } => {
                        info!(reason = %reason, "device announced shutdown");
                        self.channels.emit(ClientEvent::DeviceShutdown {
                            reason: reason.clone(),
                        });
                    }
                    phone_core::SystemDelta::Stats { .. } => {}
                }
            }
            Delta::Config(change) => {
                if self.machine.apply_config(&change) {
                    self.channels.emit(ClientEvent::ConfigApplied {
                        key: change.key.clone(),
                    });
                }
            }
            Delta::Diagnostic(payload) => {
                self.channels.emit(ClientEvent::DiagnosticSnapshot { payload });
            }
            Delta::Unknown => {
                self.unknown += 1;
            }
        }

        self.dirty = true;
        self.publish_state();
    }

    fn handle_duration_tick(&mut self) {
        if !self.machine.call_open() {
            self.tick.take();
            return;
        }

        let now = now_ts();
        if let Some(record) = self.machine.watchdog_sweep(now) {
            self.finalize_records(vec![record]);
            self.tick.take();
            self.publish_state();
            return;
        }

        if let Some(seconds) = self.machine.call_duration_seconds(now) {
            self.channels.emit(ClientEvent::DurationTick { seconds });
        }
    }

    fn finalize_records(&mut self, records: Vec<CallRecord>) {
        for record in records {
            self.channels.emit(ClientEvent::CallFinalized {
                record: record.clone(),
            });
            self.ledger.append(record);
            self.dirty = true;
        }
    }

    /// Keep the 1 Hz ticker running exactly while a call is open.
    fn sync_ticker(&mut self) {
        if self.machine.call_open() {
            if self.tick.is_none() {
                let cancel = CancellationToken::new();
                let stop = cancel.clone();
                let input_tx = self.channels.input_sender();
                let task = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                                if input_tx.send(EngineInput::DurationTick).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                self.tick = Some(TickGuard { cancel, task });
            }
        } else {
            self.tick.take();
        }
    }

    fn publish_state(&mut self) {
        let current = self.machine.state().clone();
        let modified = self.state_tx.send_if_modified(|state| {
            if *state != current {
                *state = current.clone();
                true
            } else {
                false
            }
        });
        if modified {
            self.channels.emit(ClientEvent::PhoneStateChanged {
                state: Box::new(current),
            });
        }
    }

    fn restore_snapshot(&mut self) {
        match self.store.load(&self.device_id) {
            Ok(snapshot) => {
                info!(
                    device_id = %self.device_id,
                    saved_at = snapshot.saved_at,
                    "restored state snapshot"
                );
                self.machine.restore(&snapshot);
            }
            Err(SnapshotStoreError::NotFound) => {}
            Err(err) => warn!(error = %err, "snapshot restore failed; starting cold"),
        }
    }

    fn save_snapshot(&mut self) {
        let snapshot = Snapshot::capture(&self.device_id, self.machine.state(), now_ts());
        if let Err(err) = self.store.save(&snapshot) {
            warn!(error = %err, "snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_core::{AppState, CallKind, HistoryFilter};
    use phone_platform::InMemorySnapshotStore;

    fn test_engine() -> (
        Engine,
        ClientChannels,
        mpsc::Receiver<ResyncReason>,
        Arc<InMemorySnapshotStore>,
    ) {
        let (channels, _input_rx, state_tx) = ClientChannels::new(64, 64);
        let (resync_tx, resync_rx) = mpsc::channel(4);
        let store = Arc::new(InMemorySnapshotStore::default());
        let engine = Engine::new(
            channels.clone(),
            state_tx,
            resync_tx,
            store.clone(),
            "test-device".to_owned(),
            500,
            DEFAULT_SNAPSHOT_DEBOUNCE,
        );
        (engine, channels, resync_rx, store)
    }

    fn frame(seq: u64, category: &str, event: &str, payload: Value) -> EventEnvelope {
        let mut base = json!({
            "schemaVersion": 3,
            "seq": seq,
            "ts": seq as i64 * 100,
            "integration": "dialink",
            "category": category,
            "event": event,
        });
        if let (Some(base_map), Value::Object(payload_map)) = (base.as_object_mut(), payload) {
            base_map.extend(payload_map);
        }
        let mut envelope: EventEnvelope =
            serde_json::from_value(base).expect("test frame must parse");
        envelope.received_at = seq as f64;
        envelope
    }

    #[tokio::test]
    async fn missed_call_flows_into_ledger_and_events() {
        let (mut engine, channels, _resync_rx, _store) = test_engine();
        let mut events = channels.subscribe();

        engine.handle_input(EngineInput::Frame(frame(
            1,
            "phone_state",
            "ring",
            json!({"isRinging": true}),
        )));
        engine.handle_input(EngineInput::Frame(frame(
            2,
            "phone_state",
            "state",
            json!({"state": 3, "previousState": 6}),
        )));

        let exported = engine.ledger.export(HistoryFilter::default());
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].kind, CallKind::Missed);

        let mut saw_finalized = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::CallFinalized { record } = event {
                assert_eq!(record.kind, CallKind::Missed);
                saw_finalized = true;
            }
        }
        assert!(saw_finalized, "CallFinalized event must be emitted");
    }

    #[tokio::test]
    async fn answered_call_records_device_duration() {
        let (mut engine, channels, _resync_rx, _store) = test_engine();
        let mut events = channels.subscribe();

        engine.handle_input(EngineInput::Frame(frame(
            1,
            "call",
            "start",
            json!({"number": "555", "isIncoming": true, "callStartTs": 1000}),
        )));
        assert_eq!(engine.machine.state().app_state, AppState::InCall);

        engine.handle_input(EngineInput::Frame(frame(
            2,
            "call",
            "end",
            json!({"callStartTs": 1000, "durationMs": 15000}),
        )));

        let exported = engine.ledger.export(HistoryFilter::default());
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].kind, CallKind::Incoming);
        assert_eq!(exported[0].number, "555");
        assert_eq!(exported[0].duration_s, Some(15));

        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::CallStarted { number, .. } = event {
                assert_eq!(number, "555");
                saw_started = true;
            }
        }
        assert!(saw_started, "CallStarted event must be emitted");
    }

    #[tokio::test]
    async fn stale_frames_mutate_nothing_but_bookkeeping() {
        let (mut engine, _channels, _resync_rx, _store) = test_engine();

        engine.handle_input(EngineInput::Frame(frame(
            5,
            "phone_state",
            "dnd",
            json!({"dndActive": true}),
        )));
        assert!(engine.machine.state().dnd_active);

        // Same seq, contradictory payload: must be dropped.
        engine.handle_input(EngineInput::Frame(frame(
            5,
            "phone_state",
            "dnd",
            json!({"dndActive": false}),
        )));
        assert!(engine.machine.state().dnd_active);
        assert_eq!(engine.dropped, 1);
        assert_eq!(engine.guard.tracker().last_seq, 5);
    }

    #[tokio::test]
    async fn reboot_regression_discards_open_call_and_requests_resync() {
        let (mut engine, channels, mut resync_rx, _store) = test_engine();
        let mut events = channels.subscribe();

        for (seq, category, event, payload) in [
            (1, "system", "status", json!({"freeHeap": 1})),
            (2, "system", "status", json!({"freeHeap": 2})),
            (
                3,
                "call",
                "start",
                json!({"number": "555", "isIncoming": true, "callStartTs": 300}),
            ),
        ] {
            engine.handle_input(EngineInput::Frame(frame(seq, category, event, payload)));
        }
        assert!(engine.machine.call_open());

        // Sequence regresses to 1: reboot inference.
        engine.handle_input(EngineInput::Frame(frame(
            1,
            "system",
            "status",
            json!({"freeHeap": 3}),
        )));

        assert!(!engine.machine.call_open());
        assert!(engine.guard.tracker().reboot_detected);
        assert_eq!(engine.guard.tracker().last_seq, 1);
        // The discarded call produced no record of any kind.
        assert!(engine.ledger.is_empty());
        assert_eq!(resync_rx.try_recv(), Ok(ResyncReason::Reboot));

        let mut saw_reboot = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::RebootDetected) {
                saw_reboot = true;
            }
        }
        assert!(saw_reboot, "RebootDetected event must be emitted");

        // Stream continues after the regression.
        engine.handle_input(EngineInput::Frame(frame(
            4,
            "system",
            "status",
            json!({"freeHeap": 4}),
        )));
        assert_eq!(engine.guard.tracker().last_seq, 4);
    }

    #[tokio::test]
    async fn polled_snapshot_reconciles_state_and_seq() {
        let (mut engine, _channels, _resync_rx, _store) = test_engine();

        engine.handle_input(EngineInput::PolledSnapshot(json!({
            "seq": 40,
            "phone": {"state": 3, "dndActive": true},
            "config": {"ringPattern": "500,500"}
        })));

        assert_eq!(engine.machine.state().app_state, AppState::Idle);
        assert!(engine.machine.state().dnd_active);
        assert_eq!(engine.machine.state().ring_pattern, "500,500");
        assert_eq!(engine.guard.tracker().last_seq, 40);
        assert!(engine.machine.state().connected);
    }

    #[tokio::test]
    async fn history_queries_answer_through_the_engine_queue() {
        let (mut engine, _channels, _resync_rx, _store) = test_engine();

        for seq in 1..=4u64 {
            engine.handle_input(EngineInput::Frame(frame(
                seq,
                "call",
                "blocked",
                json!({"number": format!("66{seq}")}),
            )));
        }

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        engine.handle_input(EngineInput::HistoryExport {
            filter: HistoryFilter {
                older_than: None,
                keep_last: Some(2),
            },
            reply: reply_tx,
        });
        let exported = reply_rx.await.expect("export reply");
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].number, "664");

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        engine.handle_input(EngineInput::HistoryClear {
            filter: HistoryFilter::default(),
            reply: reply_tx,
        });
        assert_eq!(reply_rx.await.expect("clear reply"), 4);
        assert!(engine.ledger.is_empty());
    }

    #[tokio::test]
    async fn epoch_reset_accepts_fresh_sequence_without_reboot() {
        let (mut engine, _channels, _resync_rx, _store) = test_engine();

        engine.handle_input(EngineInput::Frame(frame(
            500,
            "system",
            "status",
            json!({"freeHeap": 1}),
        )));
        engine.handle_input(EngineInput::EpochReset { resumed: true });
        engine.handle_input(EngineInput::Frame(frame(
            1,
            "system",
            "status",
            json!({"freeHeap": 2}),
        )));

        assert!(!engine.guard.tracker().reboot_detected);
        assert_eq!(engine.guard.tracker().last_seq, 1);
    }

    #[tokio::test]
    async fn final_snapshot_survives_roundtrip_through_store() {
        let (mut engine, _channels, _resync_rx, store) = test_engine();

        engine.handle_input(EngineInput::Frame(frame(
            1,
            "config",
            "config_delta",
            json!({"key": "ring_pattern", "newValue": "300,300x2"}),
        )));
        engine.save_snapshot();

        let snapshot = store.load("test-device").expect("snapshot saved");
        assert_eq!(snapshot.ring_pattern, "300,300x2");
        assert_eq!(snapshot.last_seq, 1);

        // A fresh engine restores the persisted projection.
        let (mut cold, _channels, _resync_rx, _) = test_engine();
        cold.store = store.clone();
        cold.restore_snapshot();
        assert_eq!(cold.machine.state().ring_pattern, "300,300x2");
    }

    #[tokio::test]
    async fn duration_tick_emits_and_stops_when_idle() {
        let (mut engine, channels, _resync_rx, _store) = test_engine();
        let mut events = channels.subscribe();

        // Anchor the start at the real clock so the watchdog stays quiet.
        let mut start = frame(
            1,
            "call",
            "start",
            json!({"number": "1", "isIncoming": false, "callStartTs": 0}),
        );
        start.received_at = now_ts();
        engine.handle_input(EngineInput::Frame(start));
        engine.handle_input(EngineInput::DurationTick);

        let mut saw_tick = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::DurationTick { .. }) {
                saw_tick = true;
            }
        }
        assert!(saw_tick, "DurationTick must be emitted while in call");

        engine.handle_input(EngineInput::Frame(frame(
            2,
            "call",
            "end",
            json!({"durationMs": 1000}),
        )));
        assert!(engine.tick.is_none(), "ticker must stop on call end");
    }

    #[test]
    fn device_config_builds_expected_urls() {
        let config = DeviceConfig::new("10.0.0.7");
        assert_eq!(
            config.base_url().expect("base url").as_str(),
            "http://10.0.0.7:8080/"
        );
        assert_eq!(
            config.websocket_url().expect("ws url").as_str(),
            "ws://10.0.0.7:8080/ws"
        );
        assert_eq!(config.device_id, "10.0.0.7:8080");

        let config = DeviceConfig::new("phone.local").with_port(9090);
        assert_eq!(config.device_id, "phone.local:9090");
    }

    #[tokio::test]
    async fn client_side_validation_rejects_bad_input_before_the_network() {
        let client =
            DeviceClient::new(&DeviceConfig::new("127.0.0.1")).expect("client must build");

        let err = client.dial("").await.expect_err("empty number must fail");
        assert_eq!(err.code, "invalid_input");

        let err = client.dial_digit(12).await.expect_err("digit must fail");
        assert_eq!(err.code, "invalid_input");

        let err = client
            .set_dialing_code("12a")
            .await
            .expect_err("non-digit code must fail");
        assert_eq!(err.code, "invalid_input");
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        let err = parse_frame("{not json").expect_err("must fail");
        assert_eq!(err.category, ErrorCategory::Protocol);

        let err = parse_frame(r#"{"seq": 1}"#).expect_err("incomplete envelope must fail");
        assert_eq!(err.category, ErrorCategory::Protocol);
    }

    #[tokio::test]
    #[ignore = "runs against a live device, requires env vars"]
    async fn live_device_smoke() {
        let host = std::env::var("DIALINK_HOST").expect("DIALINK_HOST must be set");
        let store = Arc::new(InMemorySnapshotStore::default());
        let handle = spawn_runtime(RuntimeConfig::new(DeviceConfig::new(host)), store)
            .expect("runtime must spawn");

        let mut events = handle.subscribe();
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("expected an event within 30s")
            .expect("event stream open");
        println!("first event: {event:?}");

        handle.shutdown().await;
    }
}
