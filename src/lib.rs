//! # wsio - Symmetric WebSocket Endpoint Core
//!
//! `wsio` is an RFC 6455 WebSocket endpoint library layered on an
//! already-established byte stream: message-granularity send/receive with
//! streaming bodies, pings, and graceful close with negotiated codes.
//!
//! ## Features
//!
//! - **Role-symmetric core**: the same [`Connection`] serves initiator
//!   (masking) and responder roles
//! - **Chunk-fed frame parser** with strict RFC 6455 validation and
//!   configurable frame/message limits
//! - **Streaming message bodies** with consumer backpressure
//! - **Heartbeat scheduler**: idle pings, unanswered-ping close, and
//!   per-connection byte/frame rate limiting on a shared one-second tick
//! - **permessage-deflate** via a pluggable [`DeflateContext`]
//! - **Connection statistics** exposed as tear-free snapshots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wsio::{close_code, Connection, Options, Role, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let conn = Connection::establish(stream, Role::Responder, Options::default(), &scheduler);
//!
//! while let Some(mut msg) = conn.receive().await? {
//!     let text = msg.text().await?;
//!     conn.send(&text).await?;
//! }
//! conn.close(close_code::NORMAL, "done").await?;
//! ```
//!
//! The opening HTTP upgrade handshake, TLS, and extension negotiation are
//! external collaborators: hand `establish` a connected stream and, when
//! permessage-deflate was negotiated, a configured [`DeflateContext`].

pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod scheduler;

pub use compression::{DeflateConfig, DeflateContext};
pub use config::Options;
pub use connection::{Connection, ConnectionInfo, ConnectionState, EndpointParams, Role};
pub use error::{Error, Result};
pub use message::{close_code, Message};
pub use protocol::{Frame, FrameEvent, FrameParser, OpCode};
pub use scheduler::Scheduler;
