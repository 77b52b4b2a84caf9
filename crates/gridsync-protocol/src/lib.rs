//! Gridsync Protocol - replication wire model
//!
//! Types and codecs shared by replication sources and targets:
//! - Ordered packets and their kind-specific payloads
//! - Handshake request/response
//! - Framed envelope with CRC32 validation
//!
//! ```text
//! [version:1][frame_type:1][length:4][body:N][crc32:4]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod packet;

pub use error::{ProtocolError, Result};
pub use frame::{Frame, FrameType, PROTOCOL_VERSION, RejectCode};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use packet::{
    BatchPacket, ChangeData, EntryData, EntryOperation, OperationKind, OrderedPacket, Payload,
    TransactionData, TxnPhase, TypeDescriptor, TypeIndexData,
};
