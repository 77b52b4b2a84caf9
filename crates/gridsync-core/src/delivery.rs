//! Source-side delivery loop for one target channel
//!
//! ```text
//! connect ─> Connect ─> HandshakeRequest ─> backlog.handshake ─> HandshakeReply ─> Ack
//!                                                 │
//!                              ResumeKeyCompacted ┴─> Reject ─> first HandshakeRequest
//!
//! then: next_batch ─> Batch ─> Ack{key} ─> confirm
//! ```
//!
//! A failed batch pins a pending error on the channel, marks it disconnected
//! and re-establishes through [`run_task`].

use crate::backlog::SourceGroupBacklog;
use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, RetryTask, run_task};
use crate::target::reject;
use crate::transport::{OrderedTransport, exchange};
use async_trait::async_trait;
use gridsync_protocol::{BatchPacket, Frame, HandshakeRequest, RejectCode};
use std::sync::Arc;
use tokio::sync::watch;

/// Delivery statistics of one worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Batches acknowledged
    pub batches_sent: u64,
    /// Packets acknowledged
    pub packets_sent: u64,
    /// Highest key the target acknowledged
    pub last_acked_key: u64,
    /// Channels established
    pub handshakes: u64,
    /// Full resyncs forced by compacted resume keys
    pub resyncs: u64,
    /// Failed establish attempts
    pub reconnect_failures: u64,
    /// Failed batches
    pub delivery_failures: u64,
}

/// Drives one channel from a group backlog to one target
pub struct DeliveryWorker<T: OrderedTransport> {
    source: String,
    target: String,
    backlog: Arc<SourceGroupBacklog>,
    transport: T,
    config: DeliveryConfig,
    established: bool,
    stats: DeliveryStats,
}

impl<T: OrderedTransport> DeliveryWorker<T> {
    /// Create a worker delivering `backlog` to `target` over `transport`
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        backlog: Arc<SourceGroupBacklog>,
        transport: T,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            backlog,
            transport,
            config,
            established: false,
            stats: DeliveryStats::default(),
        }
    }

    /// Target name
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the channel is established
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Statistics
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Open a connection epoch and run the handshake
    pub async fn establish(&mut self) -> Result<()> {
        self.established = false;
        self.transport.connect().await?;

        let connect = Frame::Connect {
            source: self.source.clone(),
            group: self.backlog.group().to_string(),
        };
        let mut request = expect_handshake(exchange(&mut self.transport, &connect).await?)?;

        loop {
            match self.backlog.handshake(&self.target, &request) {
                Ok(response) => {
                    let start = response.start_key;
                    match exchange(&mut self.transport, &Frame::HandshakeReply(response)).await? {
                        Frame::Ack { .. } => {
                            self.established = true;
                            self.stats.handshakes += 1;
                            tracing::info!(
                                "Channel {} -> {} established at key {}",
                                self.source,
                                self.target,
                                start
                            );
                            return Ok(());
                        }
                        other => {
                            let _ = self.backlog.channel_disconnected(&self.target);
                            return Err(unexpected_reply(other, "handshake reply"));
                        }
                    }
                }
                Err(e @ Error::ResumeKeyCompacted { .. }) if !request.first_handshake => {
                    tracing::warn!(
                        "Channel {} -> {}: {}, forcing full resync",
                        self.source,
                        self.target,
                        e
                    );
                    self.stats.resyncs += 1;
                    let reply = exchange(&mut self.transport, &reject(&e)).await?;
                    request = expect_handshake(reply)?;
                    if !request.first_handshake {
                        return Err(Error::handshake(
                            "target kept resuming after a compacted resume key",
                        ));
                    }
                }
                Err(e) => {
                    let _ = exchange(&mut self.transport, &reject(&e)).await;
                    return Err(e);
                }
            }
        }
    }

    /// Ship the next batch if one is ready (or any pending packets when
    /// `force`); returns the number of packets acknowledged
    pub async fn step(&mut self, force: bool) -> Result<usize> {
        if !self.established {
            return Err(Error::channel(format!(
                "channel {} -> {} not established",
                self.source, self.target
            )));
        }

        let batch = if force {
            self.backlog.flush(&self.target)?
        } else {
            self.backlog.next_batch(&self.target)?
        };
        let Some(batch) = batch else {
            return Ok(0);
        };
        let first = batch.first_key().unwrap_or_default();
        let count = batch.len();

        match self.ship(batch).await {
            Ok(key) => {
                self.backlog.confirm(&self.target, key)?;
                self.stats.batches_sent += 1;
                self.stats.packets_sent += count as u64;
                self.stats.last_acked_key = self.stats.last_acked_key.max(key);
                Ok(count)
            }
            Err(e) => {
                self.stats.delivery_failures += 1;
                let message = format!("batch at key {} to {} failed: {}", first, self.target, e);
                self.backlog.record_delivery_error(&self.target, first, e)?;
                Err(Error::transport(message))
            }
        }
    }

    async fn ship(&mut self, batch: BatchPacket) -> Result<u64> {
        match exchange(&mut self.transport, &Frame::Batch(batch)).await? {
            Frame::Ack { key } => Ok(key),
            other => Err(unexpected_reply(other, "batch")),
        }
    }

    /// Ship everything pending right now; returns the packets acknowledged
    pub async fn deliver_pending(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let shipped = self.step(true).await?;
            if shipped == 0 {
                return Ok(total);
            }
            total += shipped;
        }
    }

    /// Drop the connection epoch; the channel stays registered for resume
    pub async fn disconnect(&mut self) {
        self.established = false;
        if let Err(e) = self.backlog.channel_disconnected(&self.target) {
            tracing::debug!("Channel {} already gone: {}", self.target, e);
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!("Closing transport to {} failed: {}", self.target, e);
        }
    }

    /// Re-establish with backoff
    pub async fn reestablish(&mut self) -> Result<()> {
        let config = RetryConfig::from_delivery(&self.config);
        let mut task = Establish { worker: self };
        run_task(config, &mut task).await
    }

    /// Deliver until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DeliveryStats {
        tracing::info!("Delivery {} -> {} started", self.source, self.target);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.established {
                let result = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = self.reestablish() => result,
                };
                if let Err(e) = result {
                    tracing::warn!(
                        "Channel {} -> {} could not be established: {}",
                        self.source,
                        self.target,
                        e
                    );
                    let pause = self.config.reconnect_max_delay;
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                continue;
            }

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.step(false) => result,
            };
            match result {
                Ok(0) => {
                    let idle = self.config.poll_interval;
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Delivery {} -> {} failed: {}", self.source, self.target, e);
                    self.disconnect().await;
                }
            }
        }

        self.disconnect().await;
        tracing::info!(
            "Delivery {} -> {} stopped after {} packets",
            self.source,
            self.target,
            self.stats.packets_sent
        );
        self.stats
    }
}

struct Establish<'a, T: OrderedTransport> {
    worker: &'a mut DeliveryWorker<T>,
}

#[async_trait]
impl<T: OrderedTransport> RetryTask for Establish<'_, T> {
    type Output = ();

    async fn try_once(&mut self) -> Result<()> {
        self.worker.establish().await
    }

    fn on_failure(&mut self, attempt: u32, error: &Error) {
        self.worker.stats.reconnect_failures += 1;
        tracing::debug!(
            "Establishing {} -> {} failed (attempt {}): {}",
            self.worker.source,
            self.worker.target,
            attempt,
            error
        );
    }
}

fn expect_handshake(reply: Frame) -> Result<HandshakeRequest> {
    match reply {
        Frame::Handshake(request) => Ok(request),
        other => Err(unexpected_reply(other, "connect")),
    }
}

/// Error for a reply that is not what the exchange expects
fn unexpected_reply(reply: Frame, context: &str) -> Error {
    match reply {
        Frame::Reject { code, message } => match code {
            RejectCode::SourceAlreadyAttached => {
                Error::retryable(format!("target refused {}: {}", context, message))
            }
            RejectCode::UnknownGroup => Error::UnknownMember(message),
            RejectCode::Protocol | RejectCode::ResumeKeyCompacted => {
                Error::channel(format!("target rejected {}: {}", context, message))
            }
            RejectCode::Internal => Error::transport(format!("target failed {}: {}", context, message)),
        },
        other => Error::channel(format!(
            "unexpected {:?} reply to {}",
            other.frame_type(),
            context
        )),
    }
}
