//! HTTP/1.1 request handling for the static file server.
//!
//! # Architecture
//!
//! - **`connection`**: per-client state and the read / process / write cycle
//! - **`parser`**: request-line, header-line and form-body tokenising
//! - **`request`**: resumable request state machine fed from a [`Buffer`](crate::buffer::Buffer)
//! - **`response`**: status line, headers, canned error pages and the mapped file body
//! - **`writer`**: vectored writes of header region plus file body
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Request State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │ RequestLine │ ← METHOD SP PATH SP HTTP/VERSION
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │   Headers   │ ← key: value ... blank line
//!        └──────┬──────┘
//!               │ Content-Length > 0
//!               ▼
//!        ┌─────────────┐
//!        │    Body     │ ← exactly Content-Length bytes
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │   Finish    │ ← form decoding, login / register
//!        └─────────────┘
//! ```
//!
//! Running out of input in any state is not an error: the parser keeps what
//! it has consumed and resumes on the next read.

pub mod connection;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
