use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::http::request::{HttpRequest, ParseStatus};
use crate::http::response::{HttpResponse, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::store::Authenticator;

/// Level-triggered writes keep going while more than this much is pending.
const LARGE_WRITE: usize = 10240;

/// Settings and shared handles every connection needs.
#[derive(Clone)]
pub struct ConnContext {
    pub src_dir: PathBuf,
    pub edge_triggered: bool,
    pub auth: Arc<dyn Authenticator>,
    pub user_count: Arc<AtomicUsize>,
}

impl ConnContext {
    pub fn new(src_dir: impl Into<PathBuf>, edge_triggered: bool, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            src_dir: src_dir.into(),
            edge_triggered,
            auth,
            user_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("src_dir", &self.src_dir)
            .field("edge_triggered", &self.edge_triggered)
            .field("user_count", &self.user_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Process {
    /// The buffered input does not hold a full request yet.
    Incomplete,
    /// A response is staged for writing.
    Ready { keep_alive: bool },
}

/// What the poll thread should do with a connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the socket to become readable.
    Read,
    /// Wait for the socket to become writable; a response is half sent.
    Write,
    /// More requests are already buffered.
    Process,
    Close,
}

/// One client connection: socket, read and write buffers, and the request
/// and response currently being handled.
///
/// ```text
///   readable ──► read() ──► process() ──► write() ──► keep-alive? ──► readable
///                               │             │             └─ no ──► close
///                               │             └─ would block ──► writable
///                               └─ incomplete ──► readable
/// ```
pub struct HttpConn {
    stream: TcpStream,
    addr: SocketAddr,
    closed: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    writer: ResponseWriter,
    request: HttpRequest,
    response: HttpResponse,
    keep_alive: bool,
    ctx: ConnContext,
}

impl HttpConn {
    pub fn new(stream: TcpStream, addr: SocketAddr, ctx: ConnContext) -> Self {
        let users = ctx.user_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(%addr, fd = stream.as_raw_fd(), users, "client connected");
        Self {
            stream,
            addr,
            closed: false,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            writer: ResponseWriter::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            keep_alive: false,
            ctx,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Pulls bytes off the socket into the read buffer. Edge-triggered
    /// connections read until the socket would block.
    ///
    /// A peer that has closed its end surfaces as [`ErrorKind::UnexpectedEof`].
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    total += n;
                    if !self.ctx.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends the staged response. Edge-triggered connections, and any
    /// connection with a large amount pending, keep writing until done or
    /// until the socket would block.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let n = match self
                .writer
                .write_once(&mut self.stream, &mut self.write_buf, self.response.file())
            {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            total += n;
            if !self.ctx.edge_triggered && self.to_write_bytes() <= LARGE_WRITE {
                break;
            }
        }
        Ok(total)
    }

    pub fn to_write_bytes(&self) -> usize {
        self.writer.remaining(&self.write_buf, self.response.file())
    }

    /// Parses the next request out of the read buffer and stages its
    /// response. A malformed request is answered with 400 and the connection
    /// is marked for closing.
    pub fn process(&mut self) -> Process {
        if self.request.is_finished() {
            self.request.init();
        }
        if self.read_buf.readable_bytes() == 0 {
            return Process::Incomplete;
        }

        let code = match self.request.parse(&mut self.read_buf, self.ctx.auth.as_ref()) {
            Ok(ParseStatus::Incomplete) => return Process::Incomplete,
            Ok(ParseStatus::Complete) => {
                self.keep_alive = self.request.is_keep_alive();
                None
            }
            Err(e) => {
                warn!(addr = %self.addr, cause = %e, "bad request");
                self.read_buf.retrieve_all();
                self.keep_alive = false;
                Some(StatusCode::BadRequest)
            }
        };

        self.write_buf.retrieve_all();
        self.writer.reset();
        self.response
            .init(&self.ctx.src_dir, self.request.path(), self.keep_alive, code);
        self.response.make_response(&mut self.write_buf);
        if code.is_some() {
            self.request.init();
        }

        Process::Ready {
            keep_alive: self.keep_alive,
        }
    }

    /// Writes what is pending and decides what the connection waits on next.
    pub fn flush(&mut self) -> Outcome {
        match self.write() {
            Ok(_) if self.to_write_bytes() > 0 => Outcome::Write,
            Ok(_) => self.finish_response(),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Outcome::Write,
            Err(e) => {
                debug!(addr = %self.addr, cause = %e, "write failed");
                Outcome::Close
            }
        }
    }

    /// Handles every complete request in the read buffer, writing each
    /// response before parsing the next.
    pub fn serve(&mut self) -> Outcome {
        loop {
            if self.process() == Process::Incomplete {
                return Outcome::Read;
            }
            match self.flush() {
                Outcome::Process => continue,
                outcome => return outcome,
            }
        }
    }

    /// Releases the response mapping and updates the live-connection count.
    /// The socket itself is closed when the connection is dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.unmap_file();
        let users = self.ctx.user_count.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(addr = %self.addr, fd = self.fd(), users, "client quit");
    }

    fn finish_response(&mut self) -> Outcome {
        self.response.unmap_file();
        if !self.keep_alive {
            Outcome::Close
        } else if self.read_buf.readable_bytes() > 0 {
            Outcome::Process
        } else {
            Outcome::Read
        }
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("addr", &self.addr)
            .field("fd", &self.fd())
            .field("closed", &self.closed)
            .field("keep_alive", &self.keep_alive)
            .field("pending_read", &self.read_buf.readable_bytes())
            .field("pending_write", &self.to_write_bytes())
            .finish()
    }
}
