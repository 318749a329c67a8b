//! Event loop and its building blocks.
//!
//! - **`epoller`**: `epoll` registration and readiness polling
//! - **`timer`**: min-heap of idle-connection deadlines
//! - **`waker`**: `eventfd` used to interrupt a blocked poll
//! - **`webserver`**: the reactor tying them to the worker pool

pub mod epoller;
pub mod timer;
pub mod waker;
pub mod webserver;

pub use webserver::{ShutdownHandle, WebServer};
