use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tempfile::TempDir;
use tinyweb::buffer::Buffer;
use tinyweb::http::response::{HttpResponse, StatusCode};

fn file(site: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = site.path().join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    path
}

fn build(site: &TempDir, path: &str, keep_alive: bool, code: Option<StatusCode>) -> (HttpResponse, String) {
    let mut response = HttpResponse::new();
    response.init(site.path(), path, keep_alive, code);
    let mut buf = Buffer::default();
    response.make_response(&mut buf);
    let head = buf.retrieve_all_to_string();
    (response, head)
}

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::Forbidden.as_u16(), 403);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::BadRequest.reason_phrase(), "Bad Request");
    assert_eq!(StatusCode::Forbidden.reason_phrase(), "Forbidden");
    assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    assert_eq!(
        StatusCode::InternalServerError.reason_phrase(),
        "Internal Server Error"
    );
}

#[test]
fn test_response_serves_existing_file() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "index.html", b"<h1>hello</h1>");

    let (response, head) = build(&site, "/index.html", true, None);

    assert_eq!(response.code(), Some(StatusCode::Ok));
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    assert!(head.contains("Content-type: text/html\r\n"));
    assert!(head.ends_with("Content-length: 14\r\n\r\n"));
    assert_eq!(response.file(), b"<h1>hello</h1>");
    assert_eq!(response.file_len(), 14);
}

#[test]
fn test_response_missing_file_is_404() {
    let site = tempfile::tempdir().unwrap();

    let (response, head) = build(&site, "/nope.html", false, None);

    assert_eq!(response.code(), Some(StatusCode::NotFound));
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(head.contains("Content-type: text/html\r\n"));
    assert!(head.contains("File NotFound!"));
    assert_eq!(response.file_len(), 0);
}

#[test]
fn test_response_error_page_length_matches_body() {
    let site = tempfile::tempdir().unwrap();

    let (_, head) = build(&site, "/nope.html", false, None);

    let (headers, body) = head.split_once("\r\n\r\n").unwrap();
    let declared: usize = headers
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, body.len());
}

#[test]
fn test_response_directory_is_404() {
    let site = tempfile::tempdir().unwrap();
    fs::create_dir(site.path().join("sub")).unwrap();

    let (response, _) = build(&site, "/sub", false, None);

    assert_eq!(response.code(), Some(StatusCode::NotFound));
}

#[test]
fn test_response_unreadable_file_is_403() {
    let site = tempfile::tempdir().unwrap();
    let path = file(&site, "secret.txt", b"top secret");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

    let (response, head) = build(&site, "/secret.txt", false, None);

    assert_eq!(response.code(), Some(StatusCode::Forbidden));
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(response.file().is_empty());
}

#[test]
fn test_response_parent_dir_is_403() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "index.html", b"x");

    let (response, _) = build(&site, "/../etc/passwd", false, None);

    assert_eq!(response.code(), Some(StatusCode::Forbidden));
}

#[test]
fn test_response_explicit_bad_request() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "index.html", b"x");

    let (response, head) = build(&site, "/index.html", false, Some(StatusCode::BadRequest));

    assert_eq!(response.code(), Some(StatusCode::BadRequest));
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.file().is_empty());
}

#[test]
fn test_response_empty_file_is_not_mapped() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "empty.txt", b"");

    let (response, head) = build(&site, "/empty.txt", false, None);

    assert_eq!(response.code(), Some(StatusCode::Ok));
    assert!(head.contains("Content-type: text/plain\r\n"));
    assert!(head.ends_with("Content-length: 0\r\n\r\n"));
    assert!(response.file().is_empty());
}

#[test]
fn test_response_unknown_suffix_is_octet_stream() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "blob.bin", b"\x00\x01");

    let (_, head) = build(&site, "/blob.bin", false, None);

    assert!(head.contains("Content-type: application/octet-stream\r\n"));
}

#[test]
fn test_response_unmap_is_idempotent() {
    let site = tempfile::tempdir().unwrap();
    file(&site, "a.css", b"body{}");

    let (mut response, _) = build(&site, "/a.css", false, None);
    assert_eq!(response.file_len(), 6);

    response.unmap_file();
    response.unmap_file();

    assert!(response.file().is_empty());
}
