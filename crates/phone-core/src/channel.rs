use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::envelope::EventEnvelope;
use crate::history::HistoryFilter;
use crate::types::{CallRecord, ClientEvent, ConnectionState, DiagnosticsReport, PhoneState};

/// Broadcast event stream type consumed by host subscribers.
pub type EventStream = broadcast::Receiver<ClientEvent>;

/// Errors returned by engine channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The engine input receiver side is closed.
    #[error("engine input channel is closed")]
    EngineClosed,
    /// The engine dropped the reply sender before answering.
    #[error("engine dropped the query reply")]
    ReplyDropped,
}

/// One unit of work for the engine pipeline.
///
/// Live frames, timer ticks, polled snapshots, and host queries all travel
/// through the same queue, so the engine remains the single writer of
/// derived state and applies everything in arrival order.
#[derive(Debug)]
pub enum EngineInput {
    /// A frame received from the push event stream.
    Frame(EventEnvelope),
    /// A new connection epoch began. `resumed` is true when a previous
    /// session had been connected before (triggers resync).
    EpochReset { resumed: bool },
    /// Supervisor-observed connection state change.
    ConnectionChanged(ConnectionState),
    /// A polled device snapshot (degraded mode reconciliation).
    PolledSnapshot(Value),
    /// One-second tick while a call is open.
    DurationTick,
    /// Host query: export history records matching the filter.
    HistoryExport {
        filter: HistoryFilter,
        reply: oneshot::Sender<Vec<CallRecord>>,
    },
    /// Host query: prune history records, answering with the removed count.
    HistoryClear {
        filter: HistoryFilter,
        reply: oneshot::Sender<usize>,
    },
    /// Host query: diagnostics counters and recent raw envelopes.
    Diagnostics {
        reply: oneshot::Sender<DiagnosticsReport>,
    },
}

/// Channel set wiring the engine pipeline to transports, timers, and hosts.
#[derive(Clone, Debug)]
pub struct ClientChannels {
    input_tx: mpsc::Sender<EngineInput>,
    event_tx: broadcast::Sender<ClientEvent>,
    state_rx: watch::Receiver<PhoneState>,
}

impl ClientChannels {
    /// Create the channel set, returning it with the engine-side receiver
    /// and the state publisher.
    pub fn new(
        input_buffer: usize,
        event_buffer: usize,
    ) -> (
        Self,
        mpsc::Receiver<EngineInput>,
        watch::Sender<PhoneState>,
    ) {
        let (input_tx, input_rx) = mpsc::channel(input_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(PhoneState::default());

        (
            Self {
                input_tx,
                event_tx,
                state_rx,
            },
            input_rx,
            state_tx,
        )
    }

    /// Clone the engine input sender (used by transports and timers).
    pub fn input_sender(&self) -> mpsc::Sender<EngineInput> {
        self.input_tx.clone()
    }

    /// Clone the event sender.
    pub fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to host-facing events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Immutable snapshot of the current derived phone state.
    pub fn phone_state(&self) -> PhoneState {
        self.state_rx.borrow().clone()
    }

    /// Queue one engine input.
    pub async fn send_input(&self, input: EngineInput) -> Result<(), ChannelError> {
        self.input_tx
            .send(input)
            .await
            .map_err(|_| ChannelError::EngineClosed)
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run a request/reply query against the engine.
    pub async fn query<T>(
        &self,
        make_input: impl FnOnce(oneshot::Sender<T>) -> EngineInput,
    ) -> Result<T, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_input(make_input(reply_tx)).await?;
        reply_rx.await.map_err(|_| ChannelError::ReplyDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_inputs_to_engine_receiver() {
        let (channels, mut input_rx, _state_tx) = ClientChannels::new(8, 8);
        channels
            .send_input(EngineInput::DurationTick)
            .await
            .expect("input send should work");

        match input_rx.recv().await.expect("receiver should get input") {
            EngineInput::DurationTick => {}
            other => panic!("unexpected input: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let (channels, _input_rx, _state_tx) = ClientChannels::new(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        channels.emit(ClientEvent::ConnectionChanged {
            state: ConnectionState::Connecting,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn state_watch_reflects_publisher_updates() {
        let (channels, _input_rx, state_tx) = ClientChannels::new(4, 4);
        assert!(!channels.phone_state().dnd_active);

        let mut updated = PhoneState::default();
        updated.dnd_active = true;
        state_tx.send(updated).expect("watch send should work");

        assert!(channels.phone_state().dnd_active);
    }

    #[tokio::test]
    async fn query_round_trips_through_the_engine_queue() {
        let (channels, mut input_rx, _state_tx) = ClientChannels::new(4, 4);

        let engine = tokio::spawn(async move {
            if let Some(EngineInput::HistoryClear { filter: _, reply }) = input_rx.recv().await {
                let _ = reply.send(3);
            }
        });

        let removed = channels
            .query(|reply| EngineInput::HistoryClear {
                filter: HistoryFilter::default(),
                reply,
            })
            .await
            .expect("query should resolve");
        assert_eq!(removed, 3);
        engine.await.expect("engine task");
    }

    #[tokio::test]
    async fn query_on_closed_engine_reports_channel_error() {
        let (channels, input_rx, _state_tx) = ClientChannels::new(4, 4);
        drop(input_rx);

        let err = channels
            .query(|reply| EngineInput::Diagnostics { reply })
            .await
            .expect_err("query must fail when engine is gone");
        assert!(matches!(err, ChannelError::EngineClosed));
    }
}
