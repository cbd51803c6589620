//! Background tasks of a started board
//!
//! - ingest: transport events in, frames decoded, messages queued in order
//! - dispatch: routes queued messages one at a time
//! - handshake: asks the board for its status after link-up until it is ready
//! - keep-alive: re-requests status when the ready board goes quiet
//! - sweeper: expires aged correlated requests
//!
//! Tasks hold a weak reference to the board and stop when it is gone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BoardEvent, BoardInner};
use crate::frame::FrameCodec;
use crate::message::Message;
use crate::transport::TransportEvent;

pub(super) struct Runtime {
    cancel: CancellationToken,
    ingest: JoinHandle<mpsc::UnboundedReceiver<TransportEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The running handshake task of the current connection
pub(super) struct Handshake {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Handshake {
    fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(super) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Board handshake ended abnormally: {}", e);
        }
    }
}

impl Runtime {
    pub(super) fn start(
        inner: &Arc<BoardInner>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let ingest = tokio::spawn(ingest_loop(
            Arc::downgrade(inner),
            events,
            dispatch_tx,
            cancel.clone(),
        ));
        let tasks = vec![
            tokio::spawn(dispatch_loop(
                Arc::downgrade(inner),
                dispatch_rx,
                cancel.clone(),
            )),
            tokio::spawn(keep_alive_loop(
                Arc::downgrade(inner),
                inner.config.keep_alive(),
                cancel.clone(),
            )),
            inner
                .requests
                .spawn_sweeper(inner.config.request_sweep(), cancel.child_token()),
        ];

        Self {
            cancel,
            ingest,
            tasks,
        }
    }

    /// Cancel every task and wait for it to finish, handing back the
    /// transport event stream
    pub(super) async fn stop(self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Board task ended abnormally: {}", e);
            }
        }
        self.ingest.await.ok()
    }
}

async fn ingest_loop(
    board: Weak<BoardInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatch: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<TransportEvent> {
    let mut codec = FrameCodec;
    let mut buffer = BytesMut::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = board.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Connected(connected) => {
                inner.on_connection_changed(connected);
                if connected {
                    start_handshake(&inner, &cancel);
                } else if let Some(handshake) = inner.handshake.lock().take() {
                    handshake.cancel();
                }
            }
            TransportEvent::DataReceived(data) => {
                buffer.extend_from_slice(&data);
                drain_frames(&inner, &mut codec, &mut buffer, &dispatch);
            }
        }
    }

    trace!("Board ingest stopped");
    events
}

fn drain_frames(
    inner: &BoardInner,
    codec: &mut FrameCodec,
    buffer: &mut BytesMut,
    dispatch: &mpsc::UnboundedSender<Message>,
) {
    loop {
        match codec.decode(buffer) {
            Ok(Some(payload)) => match Message::decode(&payload) {
                Ok(message) => {
                    trace!(board = %inner.config.sid, "Received {}", message);
                    if dispatch.send(message).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(board = %inner.config.sid, "Dropping undecodable message: {}", e);
                    inner.publish(vec![BoardEvent::FrameError(e.to_string())]);
                }
            },
            Ok(None) => return,
            Err(e) => {
                // resynchronise on the next chunk
                warn!(board = %inner.config.sid, "Frame error, discarding {} buffered bytes: {}", buffer.len(), e);
                buffer.clear();
                inner.publish(vec![BoardEvent::FrameError(e.to_string())]);
                return;
            }
        }
    }
}

async fn dispatch_loop(
    board: Weak<BoardInner>,
    mut messages: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(inner) = board.upgrade() else {
            break;
        };
        inner.route_message(message).await;
    }
    trace!("Board dispatch stopped");
}

fn start_handshake(inner: &Arc<BoardInner>, parent: &CancellationToken) {
    let cancel = parent.child_token();
    let task = tokio::spawn(handshake_loop(
        Arc::downgrade(inner),
        inner.config.connect_settle(),
        inner.config.handshake_interval(),
        cancel.clone(),
    ));
    if let Some(previous) = inner.handshake.lock().replace(Handshake { cancel, task }) {
        previous.cancel();
    }
}

async fn handshake_loop(
    board: Weak<BoardInner>,
    settle: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(settle) => {}
    }

    loop {
        {
            let Some(inner) = board.upgrade() else {
                return;
            };
            let (ready, connected) = {
                let state = inner.state.lock();
                (state.ready, state.connected)
            };
            if ready || !connected {
                return;
            }
            debug!(board = %inner.config.sid, "Handshake: requesting board status");
            if let Err(e) = inner.request_status().await {
                debug!(board = %inner.config.sid, "Handshake request failed: {}", e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(period) => {}
        }
    }
}

async fn keep_alive_loop(board: Weak<BoardInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = board.upgrade() else {
            break;
        };

        let quiet = {
            let state = inner.state.lock();
            state.ready
                && state
                    .last_received
                    .map_or(true, |at| at.elapsed() > period)
        };
        if quiet {
            debug!(board = %inner.config.sid, "Keep-alive: requesting board status");
            if let Err(e) = inner.request_status().await {
                warn!(board = %inner.config.sid, "Keep-alive request failed: {}", e);
            }
        }
    }
    trace!("Board keep-alive stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use crate::config::BoardConfig;
    use crate::message::MessageKind;
    use crate::transport::{MockTransport, Transport};

    fn decode_sent(transport: &MockTransport) -> Vec<Message> {
        let mut codec = FrameCodec;
        transport
            .sent_frames()
            .into_iter()
            .map(|frame| {
                let mut buf = BytesMut::from(&frame[..]);
                let payload = codec.decode(&mut buf).unwrap().unwrap();
                Message::decode(&payload).unwrap()
            })
            .collect()
    }

    async fn started() -> (Board, Arc<MockTransport>) {
        let board = Board::new(BoardConfig::default()).unwrap();
        let transport = Arc::new(MockTransport::default());
        board.set_transport(transport.clone());
        board.begin().await.unwrap();
        (board, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_until_ready() {
        let (board, transport) = started().await;

        // settle delay, then one request per interval
        sleep(Duration::from_millis(400)).await;
        assert!(transport.sent_frames().is_empty());
        sleep(Duration::from_millis(2_200)).await;

        let sent = decode_sent(&transport);
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|m| m.kind == MessageKind::StatusRequest && m.target == 1 && m.tag == 0));

        let status = Message::new(MessageKind::StatusResponse).with_target(1);
        let frame = FrameCodec::frame(&status.encode().unwrap()).unwrap();
        transport.inject_bytes(frame);
        sleep(Duration::from_millis(10)).await;
        assert!(board.is_ready());

        transport.clear_sent();
        sleep(Duration::from_secs(3)).await;
        assert!(transport.sent_frames().is_empty());

        board.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_joins_handshake() {
        let (board, transport) = started().await;
        sleep(Duration::from_millis(100)).await;
        assert!(board.inner.handshake.lock().is_some());

        board.end().await.unwrap();
        assert!(board.inner.handshake.lock().is_none());
        sleep(Duration::from_secs(5)).await;
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_errors_do_not_stop_ingest() {
        let (board, transport) = started().await;
        let mut events = board.subscribe();

        transport.inject_bytes(vec![0x00u8, 0x01, 0x02]);
        let status = Message::new(MessageKind::StatusResponse).with_target(1);
        transport.inject_bytes(FrameCodec::frame(&status.encode().unwrap()).unwrap());
        sleep(Duration::from_millis(10)).await;

        let mut frame_errors = 0;
        let mut ready = false;
        while let Ok(event) = events.try_recv() {
            match event {
                BoardEvent::FrameError(_) => frame_errors += 1,
                BoardEvent::Ready(true) => ready = true,
                _ => {}
            }
        }
        assert_eq!(frame_errors, 1);
        assert!(ready);
        board.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_only_when_quiet() {
        let (board, transport) = started().await;
        let status = Message::new(MessageKind::StatusResponse).with_target(1);
        transport.inject_bytes(FrameCodec::frame(&status.encode().unwrap()).unwrap());
        sleep(Duration::from_millis(10)).await;
        assert!(board.is_ready());
        transport.clear_sent();

        // traffic inside each period keeps the board quiet on the wire
        for _ in 0..3 {
            sleep(Duration::from_secs(10)).await;
            transport.inject_bytes(FrameCodec::frame(&status.encode().unwrap()).unwrap());
        }
        assert!(transport.sent_frames().is_empty());

        sleep(Duration::from_secs(31)).await;
        let sent = decode_sent(&transport);
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|m| m.kind == MessageKind::StatusRequest));
        board.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_drops_readiness() {
        let (board, transport) = started().await;
        let status = Message::new(MessageKind::StatusResponse).with_target(1);
        transport.inject_bytes(FrameCodec::frame(&status.encode().unwrap()).unwrap());
        sleep(Duration::from_millis(10)).await;
        assert!(board.is_ready());

        let mut events = board.subscribe();
        transport.inject_connected(false);
        sleep(Duration::from_millis(10)).await;
        assert!(!board.is_ready());
        assert_eq!(events.try_recv().unwrap(), BoardEvent::Ready(false));

        // reconnecting handshakes again
        transport.clear_sent();
        transport.inject_connected(true);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(decode_sent(&transport).len(), 1);

        board.end().await.unwrap();
        assert!(!transport.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_twice_and_restart() {
        let (board, _transport) = started().await;
        assert!(board.begin().await.is_err());
        board.end().await.unwrap();
        assert!(!board.is_connected());
        board.begin().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(board.is_connected());
        board.end().await.unwrap();
    }
}
