//! SSH module - connections and interactive shells
//!
//! The rest of the crate talks to remote hosts through the [`Connector`],
//! [`RemoteConnection`] and [`ShellChannel`] seams. The russh-backed
//! implementation keeps a single owner task per connection.

mod client;
mod config;
mod error;
mod handle_owner;
mod shell;
mod transport;

pub use client::{build_preferred, fingerprint, ClientHandler, RusshConnection, RusshConnector};
pub use config::{AuthMethod, ConnectionConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use shell::{start_shell, ShellChannel, ShellCommand};
pub use transport::{Connector, RemoteConnection};
