use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use alert_common::alert::StreamKey;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::registry::{StreamRegistry, Subscriber};

/// How long a closing handshake may take once the process is shutting down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a subscriber connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The client closed the connection or the socket failed.
    Client,
    /// The dispatcher pruned the subscriber and dropped its queue.
    Pruned,
    /// The process is shutting down.
    Shutdown,
}

/// Drive one subscriber connection until it ends.
///
/// The connection is registered under `stream` for as long as this runs. Alert messages queued by
/// the dispatcher are written to `sink`; whatever the client sends on `inbound` is read and
/// dropped, it only serves to notice disconnects. A write to a client that stopped reading does
/// not hold the task: shutdown and inbound disconnects are still noticed while it is pending.
/// Always unsubscribes before returning.
pub async fn serve_subscriber<W, R, E>(
    mut sink: W,
    mut inbound: R,
    registry: Arc<StreamRegistry>,
    stream: StreamKey,
    buffer_size: usize,
    shutdown: CancellationToken,
) -> Disconnect
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (tx, mut rx) = mpsc::channel(buffer_size);
    let subscriber = registry.subscribe(tx, stream);

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Disconnect::Shutdown,
            outbound = rx.recv() => {
                let Some(payload) = outbound else {
                    break Disconnect::Pruned;
                };
                let written = write(
                    &mut sink,
                    &mut inbound,
                    Message::Text(payload),
                    &subscriber,
                    &shutdown,
                )
                .await;
                if let Err(reason) = written {
                    break reason;
                }
            }
            message = inbound.next() => {
                if let Some(reason) = handle_inbound(message, &subscriber) {
                    break reason;
                }
            }
        }
    };

    registry.unsubscribe(&subscriber);
    debug!(
        stream = %subscriber.stream_key(),
        subscriber = subscriber.id(),
        reason = ?reason,
        "subscriber disconnected"
    );

    if reason == Disconnect::Shutdown {
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(error = %error, "failed to close subscriber socket"),
            Err(_) => debug!(
                subscriber = subscriber.id(),
                "timed out closing subscriber socket"
            ),
        }
    }

    reason
}

/// Write one message to the socket while still watching for shutdown and for the client going
/// away. Returns why the connection ended if it did before the write completed.
async fn write<W, R, E>(
    sink: &mut W,
    inbound: &mut R,
    message: Message,
    subscriber: &Subscriber,
    shutdown: &CancellationToken,
) -> Result<(), Disconnect>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let send = sink.send(message);
    tokio::pin!(send);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Err(Disconnect::Shutdown),
            written = &mut send => {
                return written.map_err(|error| {
                    debug!(
                        stream = %subscriber.stream_key(),
                        subscriber = subscriber.id(),
                        error = %error,
                        "failed to write to subscriber socket"
                    );
                    Disconnect::Client
                });
            }
            message = inbound.next() => {
                if let Some(reason) = handle_inbound(message, subscriber) {
                    return Err(reason);
                }
            }
        }
    }
}

/// Inspect one inbound frame. Returns a reason when it ends the connection.
fn handle_inbound<E: Display>(
    message: Option<Result<Message, E>>,
    subscriber: &Subscriber,
) -> Option<Disconnect> {
    match message {
        None | Some(Ok(Message::Close(_))) => Some(Disconnect::Client),
        Some(Ok(_)) => {
            trace!(subscriber = subscriber.id(), "ignoring inbound subscriber message");
            None
        }
        Some(Err(error)) => {
            debug!(
                stream = %subscriber.stream_key(),
                subscriber = subscriber.id(),
                error = %error,
                "subscriber socket error"
            );
            Some(Disconnect::Client)
        }
    }
}
