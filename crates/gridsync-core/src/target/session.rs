//! Frame handling for one inbound connection

use super::channel::TargetChannel;
use super::group::{SharedChannel, TargetGroup};
use crate::error::Error;
use crate::transport::FrameHandler;
use gridsync_protocol::{Frame, RejectCode};
use std::sync::Arc;
use uuid::Uuid;

/// One connection epoch on the target side
///
/// Created per connection. The first frame must be `Connect`; the session
/// then answers with the target's handshake request and from there on
/// acknowledges every packet or batch it applies.
pub struct TargetSession {
    group: Arc<TargetGroup>,
    epoch: Uuid,
    source: Option<String>,
    channel: Option<SharedChannel>,
}

impl TargetSession {
    /// New session for `group`
    pub fn new(group: Arc<TargetGroup>) -> Self {
        Self {
            group,
            epoch: Uuid::new_v4(),
            source: None,
            channel: None,
        }
    }

    /// Connection epoch id
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Source attached through this session
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn on_connect(&mut self, source: String, group: String) -> Frame {
        if group != self.group.name() {
            return Frame::reject(
                RejectCode::UnknownGroup,
                format!("unknown group {}", group),
            );
        }
        if self.source.is_some() {
            return Frame::reject(RejectCode::Protocol, "session already connected");
        }

        let channel = match self.group.attach(&source) {
            Ok(channel) => channel,
            Err(e) => return reject(&e),
        };
        let request = channel.lock().handshake_request();
        match request {
            Ok(request) => {
                tracing::debug!(
                    "Group {}: session {} connected from {}",
                    group,
                    self.epoch,
                    source
                );
                self.source = Some(source);
                self.channel = Some(channel);
                Frame::Handshake(request)
            }
            Err(e) => {
                self.group.detach(&source);
                reject(&e)
            }
        }
    }

    fn with_channel<F>(&self, f: F) -> Frame
    where
        F: FnOnce(&mut TargetChannel) -> crate::Result<Frame>,
    {
        let Some(channel) = &self.channel else {
            return Frame::reject(RejectCode::Protocol, "no Connect frame received");
        };
        let mut channel = channel.lock();
        match f(&mut *channel) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    "Group {}: session {} failed: {}",
                    channel.group(),
                    self.epoch,
                    e
                );
                channel.disconnect();
                reject(&e)
            }
        }
    }
}

impl FrameHandler for TargetSession {
    fn on_receive(&mut self, frame: Frame) -> Frame {
        match frame {
            Frame::Connect { source, group } => self.on_connect(source, group),
            Frame::HandshakeReply(response) => self.with_channel(|ch| {
                ch.complete_handshake(&response)?;
                Ok(Frame::Ack {
                    key: ch.last_confirmed_key(),
                })
            }),
            Frame::Packet(packet) => self.with_channel(|ch| {
                let key = ch.consume(&packet)?;
                Ok(Frame::Ack { key })
            }),
            Frame::Batch(batch) => self.with_channel(|ch| {
                let key = ch.consume_batch(&batch)?;
                Ok(Frame::Ack { key })
            }),
            Frame::Reject {
                code: RejectCode::ResumeKeyCompacted,
                message,
            } => self.with_channel(|ch| {
                tracing::warn!("Group {}: resume refused by source: {}", ch.group(), message);
                ch.disconnect();
                ch.require_full_resync();
                Ok(Frame::Handshake(ch.handshake_request()?))
            }),
            Frame::Reject { code, message } => self.with_channel(|ch| {
                tracing::warn!(
                    "Group {}: source rejected channel ({:?}): {}",
                    ch.group(),
                    code,
                    message
                );
                ch.disconnect();
                Ok(Frame::Ack {
                    key: ch.last_confirmed_key(),
                })
            }),
            other @ (Frame::Handshake(_) | Frame::Ack { .. }) => Frame::reject(
                RejectCode::Protocol,
                format!("unexpected {:?} frame on target", other.frame_type()),
            ),
        }
    }

    fn on_close(&mut self) {
        if let Some(source) = self.source.take() {
            self.group.detach(&source);
        }
        self.channel = None;
    }
}

/// Map an error to the reject frame sent back to the peer
pub fn reject(error: &Error) -> Frame {
    let code = match error {
        Error::SourceAlreadyAttached { .. } => RejectCode::SourceAlreadyAttached,
        Error::ResumeKeyCompacted { .. } => RejectCode::ResumeKeyCompacted,
        Error::UnknownMember(_) => RejectCode::UnknownGroup,
        Error::Protocol(_) | Error::Channel(_) | Error::Handshake(_) => RejectCode::Protocol,
        _ => RejectCode::Internal,
    };
    Frame::reject(code, error.to_string())
}
