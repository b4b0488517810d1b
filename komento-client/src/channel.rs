use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::oneshot;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::{FeedMessage, FeedRequest, ThreadId};
use crate::engine::Input;

/// Lifecycle of the live feed connection, as surfaced in
/// [`crate::ThreadView`]. One attempt only ever moves forward through these
/// states and ends in `Disconnected`; starting the next attempt is the
/// engine's call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed(ThreadId),
}

impl ChannelState {
    /// True once a connection is established, whether or not the
    /// subscription went through yet.
    pub fn is_up(&self) -> bool {
        matches!(self, ChannelState::Connected | ChannelState::Subscribed(_))
    }
}

/// Both directions of one established feed connection.
pub struct Conduit {
    pub requests: mpsc::UnboundedSender<FeedRequest>,
    pub messages: mpsc::UnboundedReceiver<FeedMessage>,
}

/// Dials the live feed. Implemented by the websocket transport of the
/// embedding application and by the in-memory server the tests run against.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<Conduit>;
}

/// A [`Connector`] that never connects, for running on polling alone.
pub struct NoTransport;

#[async_trait]
impl Connector for NoTransport {
    async fn connect(&self) -> anyhow::Result<Conduit> {
        Err(anyhow::anyhow!("no live feed transport configured"))
    }
}

/// What a connection attempt reports back to the engine.
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    Opened,
    Subscribed(ThreadId),
    Message(FeedMessage),
    Down(anyhow::Error),
}

/// Handle on a running connection attempt. Dropping it tears the attempt
/// down.
pub(crate) struct ChannelGuard {
    _cancel: oneshot::Receiver<()>,
}

pub(crate) fn start(
    connector: Arc<dyn Connector>,
    thread: ThreadId,
    ping_interval: Duration,
    pong_deadline: Duration,
    out: mpsc::UnboundedSender<Input>,
) -> ChannelGuard {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(run_attempt(
        connector,
        thread,
        ping_interval,
        pong_deadline,
        out,
        cancel_tx,
    ));
    ChannelGuard { _cancel: cancel_rx }
}

/// One connection attempt: dial, subscribe, then pump messages while
/// keeping the connection alive with pings. Ends at the first failure or
/// when the engine drops its [`ChannelGuard`].
async fn run_attempt(
    connector: Arc<dyn Connector>,
    thread: ThreadId,
    ping_interval: Duration,
    pong_deadline: Duration,
    out: mpsc::UnboundedSender<Input>,
    mut cancel: oneshot::Sender<()>,
) {
    let mut cancellation = cancel.cancellation();
    let down = |err: anyhow::Error| {
        let _ = out.send(Input::Channel(ChannelSignal::Down(err)));
    };
    let conduit = tokio::select! {
        _ = &mut cancellation => return,
        connected = connector.connect() => match connected {
            Ok(conduit) => conduit,
            Err(err) => return down(err),
        },
    };
    let _ = out.send(Input::Channel(ChannelSignal::Opened));
    if conduit
        .requests
        .send(FeedRequest::Subscribe { thread_id: thread })
        .is_err()
    {
        return down(anyhow::anyhow!("feed closed before the subscription was sent"));
    }
    let _ = out.send(Input::Channel(ChannelSignal::Subscribed(thread)));

    let mut messages = conduit.messages;
    let mut next_ping = Instant::now() + ping_interval;
    let mut last_pong = Instant::now();
    loop {
        tokio::select! {
            _ = &mut cancellation => {
                tracing::debug!(thread = %thread.0, "disconnecting from the comment feed");
                return;
            }
            _ = tokio::time::sleep_until(next_ping) => {
                if conduit.requests.send(FeedRequest::Ping).is_err() {
                    return down(anyhow::anyhow!("feed closed"));
                }
                next_ping += ping_interval;
            }
            _ = tokio::time::sleep_until(last_pong + pong_deadline) => {
                return down(anyhow::anyhow!(
                    "no pong within {}ms, connection presumed dead",
                    pong_deadline.as_millis()
                ));
            }
            message = messages.recv() => match message {
                None => return down(anyhow::anyhow!("feed closed by the server")),
                Some(FeedMessage::Pong) => last_pong = Instant::now(),
                Some(message) => {
                    let _ = out.send(Input::Channel(ChannelSignal::Message(message)));
                }
            }
        }
    }
}
