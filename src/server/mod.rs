//! Server module - acceptor, connections, and command dispatch.

mod acceptor;
mod connection;
mod router;

pub use acceptor::{CommandServer, CommandServerBuilder, SessionHooks};
pub use connection::{ClientId, ConnectionRegistry, OutboundFrame, WriterHandle};
pub use router::{BoxFuture, CommandContext, CommandHandler, CommandRouter, CommandSender};
