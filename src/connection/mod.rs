//! Connection management: roles, lifecycle states, the connection core,
//! and per-connection statistics.
//!
//! ## Lifecycle
//!
//! 1. **Open** - created at handshake completion, full-duplex transfer
//! 2. **Closing** - close frame sent or received, handshake in progress
//! 3. **Closed** - stream released, callbacks fired, scheduler entry gone
//!
//! ## Example
//!
//! ```rust,ignore
//! use wsio::{Connection, Options, Role, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let conn = Connection::establish(stream, Role::Responder, Options::default(), &scheduler);
//!
//! conn.send("Hello").await?;
//! while let Some(mut msg) = conn.receive().await? {
//!     println!("got {} bytes", msg.read_to_end().await?.len());
//! }
//! conn.close(wsio::close_code::NORMAL, "done").await?;
//! ```

#[allow(clippy::module_inception)]
pub(crate) mod connection;
mod metadata;
mod role;
mod state;

pub use connection::{Connection, EndpointParams};
pub use metadata::ConnectionInfo;
pub use role::Role;
pub use state::ConnectionState;
