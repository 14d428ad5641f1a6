//! Room-based message fanout across horizontally scaled processes.
//!
//! Each process keeps its own connections; a shared pub/sub bus carries
//! published messages to every process, which then delivers them to its
//! local members of the target room.
//!
//! - [`channel`] maps room ids to bus channel names and validates them.
//! - [`message`] defines the payload type, its JSON wire codec, and the
//!   HTTP bodies.
//! - [`registry`] tracks live connections per room and performs fanout.
//! - [`bus`] abstracts the pub/sub transport, with Redis and in-memory
//!   implementations.
//! - [`relay`] publishes to the bus and runs the subscription loop that
//!   feeds the registry.
//! - [`gateway`] serves the WebSocket and HTTP endpoints.
//! - [`cli`] parses the command-line and environment configuration.

pub mod bus;
pub mod channel;
pub mod cli;
pub mod gateway;
pub mod message;
pub mod registry;
pub mod relay;
