use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::connection::{ConnContext, HttpConn, Outcome};
use crate::pool::ThreadPool;
use crate::server::epoller::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoller};
use crate::server::timer::HeapTimer;
use crate::server::waker::Waker;
use crate::store::Authenticator;

/// Most connections served at once; further clients are turned away.
const MAX_FD: usize = 65536;

const BUSY_REPLY: &[u8] = b"Server busy!";

/// Messages reaching the poll thread from workers and timers.
enum Notice {
    Done {
        fd: RawFd,
        conn: Box<HttpConn>,
        outcome: Outcome,
    },
    Expired {
        fd: RawFd,
        serial: u64,
    },
}

/// A registered client. `conn` is `None` while a worker holds it.
struct Slot {
    serial: u64,
    conn: Option<Box<HttpConn>>,
    close_pending: bool,
}

/// Stops a running [`WebServer`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(cause = %e, "failed to wake the poll thread");
        }
    }
}

/// The reactor: one poll thread owning the epoll instance, the timers and
/// every idle connection, with request handling offloaded to a
/// [`ThreadPool`].
///
/// Connections are registered one-shot. A connection handed to a worker
/// receives no further readiness until it comes back over the notice
/// channel and is re-armed.
pub struct WebServer {
    listener: TcpListener,
    listen_fd: RawFd,
    timeout: Option<Duration>,
    listen_event: u32,
    conn_event: u32,
    epoller: Epoller,
    timer: HeapTimer<RawFd>,
    pool: ThreadPool,
    conns: HashMap<RawFd, Slot>,
    ctx: ConnContext,
    waker: Arc<Waker>,
    notice_tx: Sender<Notice>,
    notice_rx: Receiver<Notice>,
    shutdown: Arc<AtomicBool>,
    next_serial: u64,
}

impl WebServer {
    pub fn new(config: &Config, auth: Arc<dyn Authenticator>) -> anyhow::Result<Self> {
        let (listen_event, conn_event) = trigger_events(config.mode);

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .with_context(|| format!("failed to bind port {}", config.port))?;
        listener
            .set_nonblocking(true)
            .context("failed to make listener non-blocking")?;
        if config.opt_linger {
            set_linger(&listener).context("failed to set SO_LINGER")?;
        }
        let listen_fd = listener.as_raw_fd();

        let epoller = Epoller::new().context("failed to create epoll instance")?;
        let waker = Arc::new(Waker::new().context("failed to create eventfd")?);
        epoller
            .add_fd(listen_fd, EPOLLIN | listen_event)
            .context("failed to register listener")?;
        epoller
            .add_fd(waker.fd(), EPOLLIN)
            .context("failed to register waker")?;

        let pool = ThreadPool::new(config.thread_num).context("failed to start worker threads")?;
        let ctx = ConnContext::new(&config.src_dir, conn_event & EPOLLET != 0, auth);
        let (notice_tx, notice_rx) = mpsc::channel();
        let timeout = (config.timeout > 0).then(|| Duration::from_millis(config.timeout));

        info!(
            port = listener.local_addr().map(|a| a.port()).unwrap_or(config.port),
            listen_et = listen_event & EPOLLET != 0,
            conn_et = ctx.edge_triggered,
            timeout_ms = config.timeout,
            threads = config.thread_num,
            src_dir = %config.src_dir.display(),
            "server init"
        );

        Ok(Self {
            listener,
            listen_fd,
            timeout,
            listen_event,
            conn_event,
            epoller,
            timer: HeapTimer::new(),
            pool,
            conns: HashMap::new(),
            ctx,
            waker,
            notice_tx,
            notice_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_serial: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Live count of connected clients, readable after the server moves
    /// onto its own thread.
    pub fn user_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.ctx.user_count)
    }

    /// Runs the event loop until [`ShutdownHandle::shutdown`] is called.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("server start");
        while !self.shutdown.load(Ordering::Acquire) {
            self.timer.tick();
            self.drain_notices();

            let n = match self.epoller.wait(self.timer.next_tick()) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("epoll wait failed"),
            };
            for i in 0..n {
                let fd = self.epoller.event_fd(i);
                let events = self.epoller.events(i);
                self.handle_event(fd, events);
            }

            self.drain_notices();
        }
        self.stop();
        Ok(())
    }

    fn handle_event(&mut self, fd: RawFd, events: u32) {
        if fd == self.listen_fd {
            self.deal_listen();
        } else if fd == self.waker.fd() {
            self.waker.drain();
        } else if events & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.close_conn(fd);
        } else if events & EPOLLIN != 0 {
            self.deal_read(fd);
        } else if events & EPOLLOUT != 0 {
            self.deal_write(fd);
        } else {
            error!(fd, events, "unexpected event");
        }
    }

    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.conns.len() >= MAX_FD {
                        warn!(%addr, "clients are full");
                        send_busy(stream);
                    } else {
                        self.add_client(stream, addr);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(cause = %e, "accept failed");
                    break;
                }
            }
            if self.listen_event & EPOLLET == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%addr, cause = %e, "failed to make client non-blocking");
            return;
        }
        let fd = stream.as_raw_fd();
        let conn = Box::new(HttpConn::new(stream, addr, self.ctx.clone()));
        if let Err(e) = self.epoller.add_fd(fd, EPOLLIN | self.conn_event) {
            warn!(fd, cause = %e, "failed to register client");
            return;
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        self.conns.insert(
            fd,
            Slot {
                serial,
                conn: Some(conn),
                close_pending: false,
            },
        );
        self.arm_timer(fd, serial);
    }

    fn deal_read(&mut self, fd: RawFd) {
        self.extend_timer(fd);
        let Some(conn) = self.idle_conn(fd) else {
            return;
        };
        match conn.read() {
            Ok(_) => self.dispatch(fd),
            Err(e) => {
                debug!(fd, cause = %e, "read failed");
                self.close_conn(fd);
            }
        }
    }

    fn deal_write(&mut self, fd: RawFd) {
        self.extend_timer(fd);
        let Some(conn) = self.idle_conn(fd) else {
            return;
        };
        let outcome = conn.flush();
        self.apply(fd, outcome);
    }

    /// Moves the connection into a worker, which reports back with a
    /// [`Notice::Done`].
    fn dispatch(&mut self, fd: RawFd) {
        let Some(mut conn) = self.conns.get_mut(&fd).and_then(|slot| slot.conn.take()) else {
            return;
        };
        let tx = self.notice_tx.clone();
        let waker = Arc::clone(&self.waker);
        let queued = self.pool.add_task(move || {
            // the connection must come back even if a handler panics
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| conn.serve())).unwrap_or_else(|_| {
                error!(fd, "request handling panicked");
                Outcome::Close
            });
            if tx.send(Notice::Done { fd, conn, outcome }).is_ok() {
                if let Err(e) = waker.wake() {
                    error!(cause = %e, "failed to wake the poll thread");
                }
            }
        });
        if !queued {
            // the rejected job dropped the connection and its socket
            self.conns.remove(&fd);
            self.timer.do_work(fd);
        }
    }

    fn apply(&mut self, fd: RawFd, outcome: Outcome) {
        match outcome {
            Outcome::Read => self.rearm(fd, EPOLLIN),
            Outcome::Write => self.rearm(fd, EPOLLOUT),
            Outcome::Process => self.dispatch(fd),
            Outcome::Close => self.close_conn(fd),
        }
    }

    fn rearm(&mut self, fd: RawFd, interest: u32) {
        if let Err(e) = self.epoller.mod_fd(fd, interest | self.conn_event) {
            warn!(fd, cause = %e, "failed to re-arm client");
            self.close_conn(fd);
        }
    }

    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notice_rx.try_recv() {
            match notice {
                Notice::Done { fd, conn, outcome } => self.complete(fd, conn, outcome),
                Notice::Expired { fd, serial } => {
                    if self.conns.get(&fd).is_some_and(|slot| slot.serial == serial) {
                        debug!(fd, "client timed out");
                        self.close_conn(fd);
                    }
                }
            }
        }
    }

    fn complete(&mut self, fd: RawFd, conn: Box<HttpConn>, outcome: Outcome) {
        let Some(slot) = self.conns.get_mut(&fd) else {
            error!(fd, "worker returned an unknown client");
            return;
        };
        slot.conn = Some(conn);
        if slot.close_pending {
            self.close_conn(fd);
            return;
        }
        if outcome != Outcome::Close {
            self.extend_timer(fd);
        }
        self.apply(fd, outcome);
    }

    /// Closes an idle connection now, or marks an in-flight one to be closed
    /// when its worker hands it back.
    fn close_conn(&mut self, fd: RawFd) {
        match self.conns.get_mut(&fd) {
            None => return,
            Some(slot) if slot.conn.is_none() => {
                slot.close_pending = true;
                return;
            }
            Some(_) => {}
        }
        let Some(Slot {
            conn: Some(mut conn), ..
        }) = self.conns.remove(&fd)
        else {
            return;
        };
        if let Err(e) = self.epoller.del_fd(fd) {
            warn!(fd, cause = %e, "failed to deregister client");
        }
        self.timer.do_work(fd);
        conn.close();
    }

    fn idle_conn(&mut self, fd: RawFd) -> Option<&mut HttpConn> {
        self.conns.get_mut(&fd).and_then(|slot| slot.conn.as_deref_mut())
    }

    fn arm_timer(&mut self, fd: RawFd, serial: u64) {
        let Some(timeout) = self.timeout else {
            return;
        };
        let tx = self.notice_tx.clone();
        self.timer.add(fd, timeout, move || {
            let _ = tx.send(Notice::Expired { fd, serial });
        });
    }

    fn extend_timer(&mut self, fd: RawFd) {
        if let Some(serial) = self.conns.get(&fd).map(|slot| slot.serial) {
            self.arm_timer(fd, serial);
        }
    }

    fn stop(&mut self) {
        info!(clients = self.conns.len(), "server stopping");
        // queued work finishes and reports back before the clients close
        self.pool.shutdown();
        self.drain_notices();

        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_conn(fd);
        }
        self.timer.clear();
        info!("server stopped");
    }
}

impl std::fmt::Debug for WebServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebServer")
            .field("listen_fd", &self.listen_fd)
            .field("clients", &self.conns.len())
            .field("timeout", &self.timeout)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Listener and connection event flags for a trigger mode.
fn trigger_events(mode: u8) -> (u32, u32) {
    let mut listen_event = EPOLLRDHUP;
    let mut conn_event = EPOLLONESHOT | EPOLLRDHUP;
    match mode {
        0 => {}
        1 => conn_event |= EPOLLET,
        2 => listen_event |= EPOLLET,
        _ => {
            listen_event |= EPOLLET;
            conn_event |= EPOLLET;
        }
    }
    (listen_event, conn_event)
}

/// Close gracefully: linger up to one second so pending data is sent.
fn set_linger(listener: &TcpListener) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 1,
    };
    // SAFETY: `linger` outlives the call and its exact size is passed.
    let rc = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast(),
            size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_busy(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(BUSY_REPLY) {
        debug!(cause = %e, "failed to send busy reply");
    }
}
