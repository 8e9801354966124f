//! Transports: streamable HTTP and line-delimited stdio.
//!
//! Both parse inbound bytes into JSON-RPC values, feed them through
//! [`ProtocolHandler::handle_value`](crate::protocol::ProtocolHandler), and
//! carry server-to-client frames back out. The HTTP transport multiplexes
//! those frames onto SSE streams; stdio writes them as lines.

pub mod http;
pub mod stdio;

pub use http::{HttpServerConfig, McpRouter};
pub use stdio::StdioTransport;
