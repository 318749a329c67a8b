use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tinyweb::config::Config;
use tinyweb::server::{ShutdownHandle, WebServer};
use tinyweb::store::{Authenticator, UserStore, UserTable};

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
    users: Arc<AtomicUsize>,
    dir: TempDir,
}

impl Running {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn page(&self, name: &str, body: &str) {
        let path = self.dir.path().join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    /// Polls the live-connection count until it reaches `expected`.
    fn wait_for_users(&self, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.users.load(Ordering::Acquire) != expected {
            assert!(
                Instant::now() < deadline,
                "users stuck at {}, wanted {expected}",
                self.users.load(Ordering::Acquire)
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn stop(mut self) -> anyhow::Result<()> {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

fn start(mode: u8, timeout_ms: u64) -> Running {
    start_with(mode, timeout_ms, Arc::new(UserStore::new(UserTable::in_memory(), 1)))
}

fn start_with(mode: u8, timeout_ms: u64, auth: Arc<dyn Authenticator>) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        port: 0,
        mode,
        timeout: timeout_ms,
        thread_num: 2,
        conn_pool_num: 1,
        open_log: false,
        src_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let mut server = WebServer::new(&config, auth).unwrap();
    let port = server.local_addr().unwrap().port();
    let handle = server.shutdown_handle();
    let users = server.user_counter();
    let thread = thread::spawn(move || server.run());

    let running = Running {
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
        handle,
        thread: Some(thread),
        users,
        dir,
    };
    running.page("index.html", "<h1>tinyweb</h1>");
    running.page("big.txt", &"x".repeat(256 * 1024));
    running
}

/// Accepts every login after a fixed delay.
struct SlowAuth(Duration);

impl Authenticator for SlowAuth {
    fn login(&self, _: &str, _: &str) -> bool {
        thread::sleep(self.0);
        true
    }

    fn register(&self, _: &str, _: &str) -> bool {
        false
    }
}

struct PanickingAuth;

impl Authenticator for PanickingAuth {
    fn login(&self, username: &str, _: &str) -> bool {
        panic!("lookup failed for {username}");
    }

    fn register(&self, _: &str, _: &str) -> bool {
        false
    }
}

fn login_request(keep_alive: bool) -> String {
    let body = "username=neo&password=matrix";
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!(
        "POST /login HTTP/1.1\r\nConnection: {connection}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn assert_index_served(server: &Running) {
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"<h1>tinyweb</h1>");
}

/// Reads one response and returns its head and body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        data.push(byte[0]);
    }
    let head = String::from_utf8(data).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .unwrap()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn assert_closed_by_peer(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn test_server_keep_alive_across_requests() {
    for mode in 0..=3 {
        let server = start(mode, 0);
        let mut stream = server.connect();

        for _ in 0..2 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "mode {mode}: {head}");
            assert_eq!(body, b"<h1>tinyweb</h1>");
        }

        server.stop().unwrap();
    }
}

#[test]
fn test_server_bad_request_closes() {
    let server = start(3, 0);
    let mut stream = server.connect();

    stream
        .write_all(b"GET nowhere HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_closed_by_peer(&mut stream);
}

#[test]
fn test_server_missing_file_keeps_connection() {
    let server = start(1, 0);
    let mut stream = server.connect();

    stream
        .write_all(b"GET /nope.png HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_server_large_file_is_sent_completely() {
    for mode in [0, 3] {
        let server = start(mode, 0);
        let mut stream = server.connect();

        stream.write_all(b"GET /big.txt HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);

        assert!(head.contains("Content-type: text/plain\r\n"));
        assert_eq!(body.len(), 256 * 1024);
        assert!(body.iter().all(|&b| b == b'x'));
        assert_closed_by_peer(&mut stream);
    }
}

#[test]
fn test_server_evicts_idle_connections() {
    let server = start(3, 200);
    let mut stream = server.connect();

    let start = Instant::now();
    assert_closed_by_peer(&mut stream);

    assert!(start.elapsed() >= Duration::from_millis(150));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_server_activity_extends_timeout() {
    let server = start(3, 300);
    let mut stream = server.connect();

    for _ in 0..3 {
        thread::sleep(Duration::from_millis(150));
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}

#[test]
fn test_server_serves_concurrent_clients() {
    let server = start(3, 0);

    let clients: Vec<_> = (0..8)
        .map(|_| {
            let mut stream = server.connect();
            thread::spawn(move || {
                for _ in 0..5 {
                    stream
                        .write_all(b"GET /index HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                        .unwrap();
                    let (_, body) = read_response(&mut stream);
                    assert_eq!(body, b"<h1>tinyweb</h1>");
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn test_server_register_and_login() {
    let server = start(3, 0);
    server.page("welcome.html", "welcome");
    let mut stream = server.connect();

    for path in ["/register", "/login"] {
        let body = "username=neo&password=matrix";
        let request = format!(
            "POST {path} HTTP/1.1\r\nConnection: keep-alive\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).unwrap();
        let (head, page) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{path}: {head}");
        assert_eq!(page, b"welcome");
    }
}

#[test]
fn test_server_shutdown_stops_run() {
    let server = start(3, 60_000);
    let _idle = server.connect();

    assert!(server.stop().is_ok());
}

#[test]
fn test_server_slow_handler_outlives_timeout() {
    let server = start_with(3, 100, Arc::new(SlowAuth(Duration::from_millis(500))));
    server.page("welcome.html", "welcome");
    let mut stream = server.connect();

    stream.write_all(login_request(true).as_bytes()).unwrap();
    let (head, page) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(page, b"welcome");
    // the expired client is closed once its worker hands it back
    assert_closed_by_peer(&mut stream);
    server.wait_for_users(0);
    assert_index_served(&server);
}

#[test]
fn test_server_handler_panic_closes_client() {
    let server = start_with(3, 0, Arc::new(PanickingAuth));
    let mut stream = server.connect();

    stream.write_all(login_request(true).as_bytes()).unwrap();

    assert_closed_by_peer(&mut stream);
    server.wait_for_users(0);
    assert_index_served(&server);
    server.wait_for_users(0);
}

#[test]
fn test_server_client_hangup_releases_slot() {
    for mode in [0, 3] {
        let server = start(mode, 0);
        let stream = server.connect();
        server.wait_for_users(1);

        drop(stream);

        server.wait_for_users(0);
    }
}

#[test]
fn test_server_counts_clients_after_requests() {
    let server = start(1, 0);
    let mut first = server.connect();
    let second = server.connect();
    server.wait_for_users(2);

    first.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    read_response(&mut first);
    assert_closed_by_peer(&mut first);
    server.wait_for_users(1);

    drop(second);
    server.wait_for_users(0);
}
