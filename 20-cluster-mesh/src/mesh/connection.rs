//! One live peer connection: a reader task and a writer loop.
//!
//! Both socket flavours (axum's server side and tungstenite's client side)
//! are adapted to the same boxed [`Frame`] sink and stream, so the loops
//! below do not care which side opened the connection.

use std::{pin::Pin, sync::Arc};

use axum::extract::ws::{self as axum_ws, CloseFrame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tracing::{debug, warn};

use crate::{error::MeshError, message::Message};

use super::{Inbound, MeshShared, Registration};

/// The part of a WebSocket message the mesh cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Frame {
    Text(String),
    Close,
    /// Pings, pongs and binary frames; never sent, skipped on read.
    Other,
}

pub(super) type FrameSink = Pin<Box<dyn Sink<Frame, Error = MeshError> + Send>>;
pub(super) type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, MeshError>> + Send>>;

impl From<tungstenite::Message> for Frame {
    fn from(message: tungstenite::Message) -> Self {
        match message {
            tungstenite::Message::Text(text) => Frame::Text(text),
            tungstenite::Message::Close(_) => Frame::Close,
            _ => Frame::Other,
        }
    }
}

impl From<Frame> for tungstenite::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => tungstenite::Message::Text(text),
            Frame::Close => tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })),
            Frame::Other => tungstenite::Message::Ping(Vec::new()),
        }
    }
}

impl From<axum_ws::Message> for Frame {
    fn from(message: axum_ws::Message) -> Self {
        match message {
            axum_ws::Message::Text(text) => Frame::Text(text),
            axum_ws::Message::Close(_) => Frame::Close,
            _ => Frame::Other,
        }
    }
}

impl From<Frame> for axum_ws::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => axum_ws::Message::Text(text),
            Frame::Close => axum_ws::Message::Close(Some(CloseFrame {
                code: axum_ws::close_code::NORMAL,
                reason: "".into(),
            })),
            Frame::Other => axum_ws::Message::Ping(Vec::new()),
        }
    }
}

pub(super) struct Connection {
    peer_id: String,
    sink: FrameSink,
    stream: FrameStream,
    registration: Registration,
}

impl Connection {
    pub(super) fn new(
        peer_id: String,
        sink: FrameSink,
        stream: FrameStream,
        registration: Registration,
    ) -> Self {
        Self {
            peer_id,
            sink,
            stream,
            registration,
        }
    }
}

/// Drives a registered connection until either direction fails or it is
/// interrupted, then tears it down. The teardown runs here and nowhere
/// else, which is what makes the peer-down event fire exactly once.
pub(super) async fn run(shared: Arc<MeshShared>, connection: Connection) {
    let Connection {
        peer_id,
        mut sink,
        stream,
        registration,
    } = connection;
    let Registration {
        serial,
        mut outbound,
        interrupt,
        inbound,
    } = registration;

    let reader = tokio::spawn(read_loop(
        peer_id.clone(),
        stream,
        inbound,
        Arc::clone(&interrupt),
    ));

    if let Err(err) = write_loop(&peer_id, &mut sink, &mut outbound, &interrupt).await {
        warn!(peer = %peer_id, error = %err, "connection writer failed");
    }

    reader.abort();
    // Close our queue before reporting, so a broadcaster blocked on it is
    // released rather than waiting on a dead peer.
    outbound.close();
    drop(outbound);
    shared.teardown(&peer_id, serial).await;
}

async fn write_loop(
    peer_id: &str,
    sink: &mut FrameSink,
    outbound: &mut mpsc::Receiver<Message>,
    interrupt: &Notify,
) -> Result<(), MeshError> {
    loop {
        tokio::select! {
            biased;
            _ = interrupt.notified() => {
                debug!(peer = %peer_id, "interrupted, closing connection");
                if let Err(err) = sink.send(Frame::Close).await {
                    debug!(peer = %peer_id, error = %err, "close frame not delivered");
                }
                return Ok(());
            }
            next = outbound.recv() => {
                let Some(message) = next else {
                    return Ok(());
                };
                let frame = message.encode()?;
                sink.send(Frame::Text(frame)).await?;
            }
        }
    }
}

async fn read_loop(
    peer_id: String,
    mut stream: FrameStream,
    inbound: mpsc::Sender<Inbound>,
    interrupt: Arc<Notify>,
) {
    let reason = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => break err.to_string(),
            None => break "stream ended".to_string(),
        };

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Close => break "closed by peer".to_string(),
            Frame::Other => continue,
        };

        let message = match Message::decode(&text) {
            Ok(message) => message,
            Err(err) => break err.to_string(),
        };

        let inbound_message = Inbound {
            peer_id: peer_id.clone(),
            message,
        };
        if inbound.send(inbound_message).await.is_err() {
            break "inbound queue closed".to_string();
        }
    };

    debug!(peer = %peer_id, %reason, "connection reader stopped");
    interrupt.notify_one();
}
