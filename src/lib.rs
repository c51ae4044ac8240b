//! # Asyncweb
//!
//! `asyncweb` is an event driven HTTP/1.1 server for `no_std` targets with an allocator, such as
//! microcontrollers with a TCP stack.  It never blocks: the transport reports what happened on a
//! connection (data, acknowledged bytes, polls, timeouts, disconnects) and the server writes no
//! more than the transport's send window allows in response.
//!
//! This crate provides:
//!
//! * request parsing, including url-encoded forms, multipart uploads and chunked bodies.
//! * routing to handlers by URI and method, with URL rewrites.
//! * responses from memory, files, readers and callbacks, with chunked encoding and `%NAME%`
//!   templates.
//! * static files with gzip variants and cache validation.
//! * Basic and Digest authentication.
//! * WebSocket endpoints (RFC 6455) and Server-Sent-Events endpoints.
//!
//! ## Basic Use
//!
//! Create a `server::Server` and register handlers.  Implement `connection::Connection` for the
//! transport's connection handle and forward the transport's events to the server's `on_*`
//! methods, or drive each client socket that implements `embedded_io_async::{Read, Write}` with
//! `pump::serve`.
//!
//! ## Example
//!
//! ```
//! use asyncweb::connection::ConnectionId;
//! use asyncweb::pump::Link;
//! use asyncweb::request::MethodSet;
//! use asyncweb::response::Response;
//! use asyncweb::server::Server;
//!
//! let mut server = Server::<Link>::default();
//! server.on("/hello", MethodSet::GET, |_req| Response::text(200, "text/plain", "Hello"));
//!
//! let id = ConnectionId(1);
//! let link = Link::new(1460);
//! server.on_connect(id, link.clone());
//! server.on_data(id, &mut b"GET /hello HTTP/1.1\r\nHost: device\r\n\r\n".to_vec(), 0);
//!
//! let out = link.take_output();
//! assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! assert!(out.ends_with(b"\r\n\r\nHello"));
//!
//! // the response is done once the transport acknowledges it
//! server.on_ack(id, out.len(), 0);
//! assert_eq!(link.closed(), Some(false));
//! server.on_disconnect(id);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod ascii;
mod multipart;

/// HTTP Basic and Digest authentication
pub mod auth;
/// Server wide limits and defaults
pub mod config;
/// The transport abstraction
pub mod connection;
/// Response content sources
pub mod content;
/// Server-Sent-Events endpoints
pub mod event_source;
/// Read only file systems
pub mod fs;
/// Request handlers and rewrites
pub mod handler;
/// HTTP Headers
pub mod header;
/// Outbound WebSocket messages
pub mod message;
/// Async socket driver
pub mod pump;
/// HTTP Requests
pub mod request;
/// HTTP responses
pub mod response;
/// HTTP server
pub mod server;
/// Static file serving
pub mod static_files;
/// Template placeholder substitution
pub mod template;
/// WebSocket framing
pub mod websocket;
/// WebSocket endpoints
pub mod ws_server;
