//! tinyweb - epoll-based static file server
//!
//! A single reactor thread accepts clients and watches their sockets; a
//! fixed pool of workers parses requests and builds responses from a
//! directory of static files, with a small credential store behind the login
//! and registration pages.

pub mod buffer;
pub mod config;
pub mod http;
pub mod logging;
pub mod pool;
pub mod server;
pub mod store;
