//! Common test utilities and helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use boardlink::{Board, BoardConfig, FrameCodec, Message, MessageKind, MockTransport};
use bytes::{Bytes, BytesMut};
use tokio::sync::broadcast;
use tokio_util::codec::Decoder;

/// Frame a message as the board firmware would
pub fn frame(message: &Message) -> Bytes {
    FrameCodec::frame(&message.encode().unwrap()).unwrap()
}

/// Decode every frame written to the mock transport
pub fn sent_messages(transport: &MockTransport) -> Vec<Message> {
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

/// Most recent status request sent to `target`
pub fn last_status_request(transport: &MockTransport, target: u8) -> Option<Message> {
    sent_messages(transport)
        .into_iter()
        .rev()
        .find(|m| m.kind == MessageKind::StatusRequest && m.target == target)
}

/// Let the board tasks process everything queued so far
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn drain<T: Clone>(events: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn board_with_mock(config: BoardConfig) -> (Board, Arc<MockTransport>) {
    let board = Board::new(config).unwrap();
    let transport = Arc::new(MockTransport::default());
    board.set_transport(transport.clone());
    (board, transport)
}

/// Status response from the board itself
pub fn board_status(board_id: u8) -> Message {
    Message::new(MessageKind::StatusResponse)
        .with_target(board_id)
        .with_argument(String::from("uno"))
        .with_argument(1_000u32)
        .with_argument(1u8)
        .with_argument(2_048u32)
}

/// Answer `request` with an empty status response
pub fn status_reply(request: &Message) -> Message {
    Message {
        tag: request.tag,
        ..Message::new(MessageKind::StatusResponse).with_target(request.target)
    }
}
