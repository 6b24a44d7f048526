//! Runs a progressive socket session on its own OS thread and runtime, and
//! turns its output into a pollable stream on the request's side.
//!
//! The worker thread is detached. Its only effect is writes to one bounded
//! channel; the consumer reaches a terminal step within
//! `global_timeout + grace` no matter what the worker does.

use super::{ProgressSink, ProgressUpdate};
use crate::error::ProviderError;
use async_trait::async_trait;
use futures_util::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;

/// Everything the worker can tell the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    Progress(ProgressUpdate),
    Report(String),
    Failed(String),
    /// The session completed without delivering a report.
    FallbackRequired,
}

/// A socket client that reports through the bridge channel. Send failures
/// mean the consumer is gone and may be ignored.
#[async_trait]
pub trait ProgressiveSocket: Send + Sync + 'static {
    async fn run(
        &self,
        command: String,
        tx: mpsc::Sender<BridgeMessage>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    pub heartbeat_after: Duration,
    pub global_timeout: Duration,
    pub grace: Duration,
    pub capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat_after: Duration::from_secs(5),
            global_timeout: Duration::from_secs(600),
            grace: Duration::from_secs(2),
            capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Inconclusive,
    /// The worker went away without a terminal message.
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    Report(String),
    /// The socket session failed; surfaced to the caller as an error.
    Failed(String),
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStep {
    /// Progress was pushed to the sink since the last step.
    Flush,
    Finished(BridgeOutcome),
}

pub const HEARTBEAT_STAGE: &str = "heartbeat";
pub const HEARTBEAT_MESSAGE: &str = "research in progress";

/// Start `socket.run(command)` on a fresh thread with a single-threaded
/// runtime. The session is cut off after `limit` whatever the socket does.
pub fn spawn_session(
    socket: Arc<dyn ProgressiveSocket>,
    command: String,
    capacity: usize,
    limit: Duration,
) -> Result<mpsc::Receiver<BridgeMessage>, ProviderError> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::Builder::new()
        .name("chatgate-research-socket".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.blocking_send(BridgeMessage::Failed(e.to_string()));
                    return;
                }
            };
            runtime.block_on(async move {
                match tokio::time::timeout(limit, socket.run(command, tx.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(target: "chatgate::bridge", error = %e, "socket session failed");
                        let reason = match e {
                            ProviderError::Socket(reason) => reason,
                            other => other.to_string(),
                        };
                        let _ = tx.send(BridgeMessage::Failed(reason)).await;
                    }
                    Err(_) => {
                        tracing::warn!(
                            target: "chatgate::bridge",
                            limit_s = limit.as_secs(),
                            "socket session exceeded its time limit"
                        );
                    }
                }
            });
            tracing::debug!(target: "chatgate::bridge", "socket worker exiting");
        })
        .map_err(|e| ProviderError::Socket(e.to_string()))?;
    Ok(rx)
}

fn outcome_of(message: BridgeMessage) -> Result<BridgeOutcome, ProgressUpdate> {
    match message {
        BridgeMessage::Progress(update) => Err(update),
        BridgeMessage::Report(text) => Ok(BridgeOutcome::Report(text)),
        BridgeMessage::Failed(reason) => Ok(BridgeOutcome::Failed(reason)),
        BridgeMessage::FallbackRequired => Ok(BridgeOutcome::Fallback(FallbackReason::Inconclusive)),
    }
}

/// Poll the worker channel until it yields a terminal outcome or the global
/// timeout (plus one grace drain) elapses. Progress goes to `sink`; each
/// drain that moved progress yields one `Flush`. The last item is always
/// `Finished`.
pub fn consume(
    mut rx: mpsc::Receiver<BridgeMessage>,
    sink: ProgressSink,
    config: BridgeConfig,
) -> impl Stream<Item = BridgeStep> + Send {
    async_stream::stream! {
        let started = Instant::now();
        let deadline = started + config.global_timeout;
        let mut last_progress = started;

        loop {
            let mut drained = 0usize;
            let mut finished = None;
            loop {
                match rx.try_recv() {
                    Ok(message) => match outcome_of(message) {
                        Err(update) => {
                            sink.emit(update);
                            drained += 1;
                        }
                        Ok(outcome) => {
                            finished = Some(outcome);
                            break;
                        }
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        finished = Some(BridgeOutcome::Fallback(FallbackReason::Disconnected));
                        break;
                    }
                }
            }

            if drained > 0 {
                last_progress = Instant::now();
                yield BridgeStep::Flush;
            }
            if let Some(outcome) = finished {
                tracing::info!(
                    target: "chatgate::bridge",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    outcome = outcome_label(&outcome),
                    "progressive session finished"
                );
                yield BridgeStep::Finished(outcome);
                return;
            }

            if drained == 0 && last_progress.elapsed() >= config.heartbeat_after {
                sink.emit(ProgressUpdate::new(HEARTBEAT_STAGE, HEARTBEAT_MESSAGE));
                last_progress = Instant::now();
                yield BridgeStep::Flush;
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    target: "chatgate::bridge",
                    timeout_s = config.global_timeout.as_secs(),
                    "progressive session timed out, draining grace window"
                );
                let grace_deadline = Instant::now() + config.grace;
                loop {
                    match tokio::time::timeout_at(grace_deadline, rx.recv()).await {
                        Ok(Some(message)) => match outcome_of(message) {
                            Err(update) => sink.emit(update),
                            Ok(outcome) => {
                                yield BridgeStep::Finished(outcome);
                                return;
                            }
                        },
                        Ok(None) => {
                            yield BridgeStep::Finished(BridgeOutcome::Fallback(FallbackReason::Disconnected));
                            return;
                        }
                        Err(_) => {
                            yield BridgeStep::Finished(BridgeOutcome::Fallback(FallbackReason::Timeout));
                            return;
                        }
                    }
                }
            }

            tokio::time::sleep(config.poll_interval).await;
        }
    }
}

fn outcome_label(outcome: &BridgeOutcome) -> &'static str {
    match outcome {
        BridgeOutcome::Report(_) => "report",
        BridgeOutcome::Fallback(FallbackReason::Inconclusive) => "inconclusive",
        BridgeOutcome::Failed(_) => "failed",
        BridgeOutcome::Fallback(FallbackReason::Disconnected) => "disconnected",
        BridgeOutcome::Fallback(FallbackReason::Timeout) => "timeout",
    }
}
