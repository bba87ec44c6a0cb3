//! # ranchwire
//!
//! Command transport for a dedicated game server speaking a proprietary
//! binary protocol over TCP.
//!
//! ## Architecture
//!
//! - **Framing**: every frame is a 4-byte obfuscated header ("magic")
//!   packing command id and payload length, followed by the payload
//! - **Obfuscation**: inbound payloads are XORed with a per-connection
//!   rolling keystream that advances once per frame
//! - **Dispatch**: directors register one typed handler per command id;
//!   frames are extracted out of each connection's read accumulator and
//!   dispatched in arrival order
//!
//! ## Example
//!
//! ```ignore
//! use ranchwire::protocol::CommandId;
//! use ranchwire::server::CommandServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CommandServer::builder()
//!         .handle(CommandId(0x2A), |ctx, name: String| async move {
//!             ctx.reply(CommandId(0x2B), &format!("welcome, {name}")).await
//!         })
//!         .build();
//!
//!     server.host("0.0.0.0:10030").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use config::{BufferMode, CipherConfig, ServerConfig, WriterSettings};
pub use error::{RanchwireError, Result};
pub use protocol::{CommandId, RollingCipher, StreamBuffer, WireDecode, WireEncode};
pub use server::{ClientId, CommandContext, CommandSender, CommandServer, SessionHooks};
