//! Ordered transport abstraction
//!
//! The engine only needs an ordered request/reply link: every frame sent is
//! answered by exactly one frame, in order. A fresh [`OrderedTransport::connect`]
//! starts a new connection epoch on the far side.

use crate::error::{Error, Result};
use crate::target::{TargetGroup, TargetSession};
use async_trait::async_trait;
use bytes::Bytes;
use gridsync_protocol::Frame;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Ordered, connection-oriented link to one target
#[async_trait]
pub trait OrderedTransport: Send {
    /// Open a new connection epoch
    async fn connect(&mut self) -> Result<()>;

    /// Send an encoded frame and wait for the encoded reply
    async fn send(&mut self, frame: Bytes) -> Result<Bytes>;

    /// Close the current epoch
    async fn close(&mut self) -> Result<()>;

    /// Whether an epoch is open
    fn is_connected(&self) -> bool;
}

/// Receiving end of a connection: one reply per frame
pub trait FrameHandler: Send {
    /// Handle a frame and produce the reply
    fn on_receive(&mut self, frame: Frame) -> Frame;

    /// Connection went away
    fn on_close(&mut self) {}
}

/// Encode `frame`, send it and decode the reply
pub async fn exchange<T>(transport: &mut T, frame: &Frame) -> Result<Frame>
where
    T: OrderedTransport + ?Sized,
{
    let reply = transport.send(frame.encode()?).await?;
    Ok(Frame::decode(&reply)?)
}

/// Fault injection and counters shared with a [`LoopbackTransport`]
#[derive(Debug, Clone, Default)]
pub struct LoopbackControl {
    severed: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    epochs: Arc<AtomicU64>,
}

impl LoopbackControl {
    /// Cut the link: the open epoch is closed on the next send and new
    /// connects fail until [`LoopbackControl::heal`]
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    /// Restore the link
    pub fn heal(&self) {
        self.severed.store(false, Ordering::SeqCst);
    }

    /// Whether the link is cut
    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }

    /// Frames delivered so far
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Epochs opened so far
    pub fn epochs(&self) -> u64 {
        self.epochs.load(Ordering::SeqCst)
    }
}

/// In-process transport into a [`TargetGroup`]
///
/// Each `connect` opens a fresh [`TargetSession`].
pub struct LoopbackTransport {
    group: Arc<TargetGroup>,
    session: Option<TargetSession>,
    control: LoopbackControl,
}

impl LoopbackTransport {
    /// Create a transport delivering into `group`
    pub fn new(group: Arc<TargetGroup>) -> Self {
        Self::with_control(group, LoopbackControl::default())
    }

    /// Create a transport sharing `control`
    pub fn with_control(group: Arc<TargetGroup>, control: LoopbackControl) -> Self {
        Self {
            group,
            session: None,
            control,
        }
    }

    /// Control handle
    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.on_close();
        }
    }
}

#[async_trait]
impl OrderedTransport for LoopbackTransport {
    async fn connect(&mut self) -> Result<()> {
        self.drop_session();
        if self.control.is_severed() {
            return Err(Error::transport("loopback link severed"));
        }
        let session = TargetSession::new(self.group.clone());
        tracing::debug!("Loopback epoch {} opened", session.epoch());
        self.session = Some(session);
        self.control.epochs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, frame: Bytes) -> Result<Bytes> {
        if self.control.is_severed() {
            self.drop_session();
            return Err(Error::transport("loopback link severed"));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(Error::transport("not connected"));
        };

        let frame = Frame::decode(&frame)?;
        let reply = session.on_receive(frame);
        self.control.frames.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(reply.encode()?)
    }

    async fn close(&mut self) -> Result<()> {
        self.drop_session();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
