use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::http::mime;

const HTTP_VERSION: &str = "HTTP/1.1";

/// World-readable permission bit.
const S_IROTH: u32 = 0o004;

/// HTTP status codes the server answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 500 Internal Server Error
    InternalServerError,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use tinyweb::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }

    pub fn is_error(&self) -> bool {
        *self != StatusCode::Ok
    }

    fn error_message(&self) -> &'static str {
        match self {
            StatusCode::Ok => "",
            StatusCode::BadRequest => "Bad Request!",
            StatusCode::Forbidden => "Forbidden!",
            StatusCode::NotFound => "File NotFound!",
            StatusCode::InternalServerError => "Internal Error!",
        }
    }
}

/// Builds the response for one request: status line and headers go into a
/// [`Buffer`], a successful body stays in a read-only file mapping so the
/// connection can send both with a single vectored write.
///
/// The mapping is released by [`unmap_file`](Self::unmap_file), by the next
/// [`init`](Self::init), or when the response is dropped.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<StatusCode>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    mm_file: Option<Mmap>,
    file_size: u64,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares a response for `path` under `src_dir`. `code = None` lets
    /// [`make_response`](Self::make_response) decide from the filesystem.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_owned();
        self.src_dir = src_dir.to_path_buf();
        self.file_size = 0;
    }

    /// Writes the status line, headers and, for error codes, a canned page
    /// into `buf`. For 200 the body is left in [`file`](Self::file).
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if matches!(self.code, None | Some(StatusCode::Ok)) {
            self.code = Some(self.check_file());
        }
        if self.code == Some(StatusCode::Ok) {
            if let Err(code) = self.map_file() {
                self.code = Some(code);
            }
        }

        let code = self.code.unwrap_or(StatusCode::BadRequest);
        self.add_state_line(buf, code);
        self.add_header(buf, code);
        self.add_content(buf, code);
        debug!(code = code.as_u16(), path = %self.path, file_len = self.file_len(), "response built");
    }

    /// Releases the file mapping. Safe to call any number of times.
    pub fn unmap_file(&mut self) {
        self.mm_file = None;
    }

    /// The mapped file body, empty unless the response is a 200.
    pub fn file(&self) -> &[u8] {
        self.mm_file.as_deref().unwrap_or(&[])
    }

    pub fn file_len(&self) -> usize {
        self.file().len()
    }

    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn check_file(&mut self) -> StatusCode {
        if Path::new(&self.path).components().any(|c| c == Component::ParentDir) {
            return StatusCode::Forbidden;
        }
        match fs::metadata(self.full_path()) {
            Err(_) => StatusCode::NotFound,
            Ok(meta) if meta.is_dir() => StatusCode::NotFound,
            Ok(meta) if meta.permissions().mode() & S_IROTH == 0 => StatusCode::Forbidden,
            Ok(meta) => {
                self.file_size = meta.len();
                StatusCode::Ok
            }
        }
    }

    fn map_file(&mut self) -> Result<(), StatusCode> {
        if self.file_size == 0 {
            return Ok(());
        }
        let path = self.full_path();
        let file = File::open(&path).map_err(|e| {
            warn!(path = %path.display(), cause = %e, "failed to open file");
            StatusCode::NotFound
        })?;
        // SAFETY: the mapping is read-only; files under the source directory
        // are not expected to be truncated while being served.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            warn!(path = %path.display(), cause = %e, "failed to map file");
            StatusCode::InternalServerError
        })?;
        self.mm_file = Some(mmap);
        Ok(())
    }

    fn add_state_line(&self, buf: &mut Buffer, code: StatusCode) {
        buf.append_str(&format!("{} {} {}\r\n", HTTP_VERSION, code.as_u16(), code.reason_phrase()));
    }

    fn add_header(&self, buf: &mut Buffer, code: StatusCode) {
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }
        let content_type = if code.is_error() { "text/html" } else { mime::content_type(&self.path) };
        buf.append_str(&format!("Content-type: {content_type}\r\n"));
    }

    fn add_content(&self, buf: &mut Buffer, code: StatusCode) {
        if code.is_error() {
            self.error_content(buf, code, code.error_message());
            return;
        }
        buf.append_str(&format!("Content-length: {}\r\n\r\n", self.file_len()));
    }

    /// Appends `Content-length`, the blank line and a canned HTML error page.
    pub fn error_content(&self, buf: &mut Buffer, code: StatusCode, message: &str) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>tinyweb</em></body></html>",
            code.as_u16(),
            code.reason_phrase(),
            message
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }
}
