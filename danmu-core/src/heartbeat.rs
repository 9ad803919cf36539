use std::time::Duration;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::FrameError;
use crate::error::Error;
use crate::transport::SharedSink;

/// One keepalive, and how it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keepalive {
    /// Sent as an ordinary data frame.
    Frame(Bytes),
    /// Sent as a transport-level ping carrying the payload.
    Ping(Bytes),
}

/// Why a heartbeat task stopped.
#[derive(Debug)]
pub enum HeartbeatExit {
    Cancelled,
    /// A keepalive could not be built or sent. The connection is presumed
    /// dead.
    Failed(Error),
}

/// Sends a keepalive frame on a fixed period until cancelled or a send
/// fails. Failures are not retried; reconnecting is the caller's decision.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatScheduler {
    interval: Duration,
}

impl HeartbeatScheduler {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// The first keepalive goes out immediately.
    pub async fn run<F>(self, sink: SharedSink, make_frame: F, cancel: CancellationToken) -> HeartbeatExit
    where
        F: Fn() -> Result<Keepalive, FrameError> + Send,
    {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent: u64 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(sent, "heartbeat stopped");
                    return HeartbeatExit::Cancelled;
                }
                _ = timer.tick() => {
                    let keepalive = match make_frame() {
                        Ok(keepalive) => keepalive,
                        Err(e) => return HeartbeatExit::Failed(e.into()),
                    };

                    // The sink lock may be held by an in-flight ack; stay
                    // responsive to cancellation while waiting for it.
                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return HeartbeatExit::Cancelled,
                        result = async {
                            let mut sink = sink.lock().await;
                            match keepalive {
                                Keepalive::Frame(frame) => sink.send(frame).await,
                                Keepalive::Ping(payload) => sink.ping(payload).await,
                            }
                        } => result,
                    };

                    if let Err(e) = result {
                        warn!(error = %e, sent, "heartbeat send failed");
                        return HeartbeatExit::Failed(e);
                    }
                    sent += 1;
                    trace!(sent, "heartbeat sent");
                }
            }
        }
    }
}
