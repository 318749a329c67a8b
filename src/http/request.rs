use std::collections::HashMap;

use tracing::debug;

use crate::buffer::Buffer;
use crate::http::parser::{self, ParseError};
use crate::store::Authenticator;

/// Longest request line or header line accepted.
pub const MAX_LINE: usize = 8 * 1024;

/// Largest request body accepted.
pub const MAX_BODY: usize = 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Pages addressable without their `.html` suffix.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const LOGIN_PAGE: &str = "/login.html";
const REGISTER_PAGE: &str = "/register.html";
const WELCOME_PAGE: &str = "/welcome.html";
const ERROR_PAGE: &str = "/error.html";

/// HTTP request methods.
///
/// Every method is parsed; the server answers all of them from the static
/// tree, and only POST bodies feed the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Submit form data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Example
    ///
    /// ```
    /// # use tinyweb::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Result of feeding buffered input to [`HttpRequest::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request has been consumed.
    Complete,
    /// More bytes are needed; everything consumed so far is kept.
    Incomplete,
}

/// An HTTP request assembled incrementally from a [`Buffer`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    state: ParseState,
    method: Option<Method>,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    post: HashMap<String, String>,
    content_length: usize,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: None,
            path: String::new(),
            version: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            post: HashMap::new(),
            content_length: 0,
        }
    }

    /// Resets to an empty request, ready for the next cycle on a connection.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Consumes as much of `buf` as the current request needs.
    ///
    /// Lines are taken out of the buffer as soon as they are complete, so a
    /// request split across several reads resumes where it stopped. When the
    /// request finishes, url-encoded form bodies are decoded and the login
    /// and register pages are resolved through `auth`.
    pub fn parse(&mut self, buf: &mut Buffer, auth: &dyn Authenticator) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(end) = buf.find(CRLF) else {
                        if buf.readable_bytes() > MAX_LINE {
                            return Err(ParseError::LineTooLong { limit: MAX_LINE });
                        }
                        return Ok(ParseStatus::Incomplete);
                    };
                    if end > MAX_LINE {
                        return Err(ParseError::LineTooLong { limit: MAX_LINE });
                    }
                    let line = std::str::from_utf8(&buf.peek()[..end])
                        .map_err(|_| ParseError::InvalidEncoding)?
                        .to_owned();
                    buf.retrieve_until(end + CRLF.len());

                    if self.state == ParseState::RequestLine {
                        self.parse_request_line(&line)?;
                    } else if line.is_empty() {
                        self.end_of_headers(auth)?;
                    } else {
                        let (key, value) = parser::parse_header_line(&line)?;
                        self.headers.insert(key.to_owned(), value.to_owned());
                    }
                }
                ParseState::Body => {
                    if buf.readable_bytes() < self.content_length {
                        return Ok(ParseStatus::Incomplete);
                    }
                    self.body = String::from_utf8_lossy(&buf.peek()[..self.content_length]).into_owned();
                    buf.retrieve(self.content_length);
                    self.finish(auth);
                }
                ParseState::Finish => return Ok(ParseStatus::Complete),
            }
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Looks a header up by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// A decoded form field from a url-encoded POST body.
    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn post_params(&self) -> &HashMap<String, String> {
        &self.post
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// True only for HTTP/1.1 requests carrying `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "HTTP/1.1" && self.header("Connection") == Some("keep-alive")
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let (method, path, version) = parser::parse_request_line(line)?;
        self.method = Some(method);
        self.version = version.to_owned();
        self.path = normalize_path(path);
        self.state = ParseState::Headers;
        Ok(())
    }

    fn end_of_headers(&mut self, auth: &dyn Authenticator) -> Result<(), ParseError> {
        if let Some(te) = self.header("Transfer-Encoding") {
            if !te.eq_ignore_ascii_case("identity") {
                return Err(ParseError::UnsupportedEncoding(te.to_owned()));
            }
        }

        self.content_length = match self.header("Content-Length") {
            None => 0,
            Some(v) => v.parse().map_err(|_| ParseError::InvalidContentLength)?,
        };
        if self.content_length > MAX_BODY {
            return Err(ParseError::BodyTooLarge {
                len: self.content_length,
                limit: MAX_BODY,
            });
        }

        if self.content_length > 0 {
            self.state = ParseState::Body;
        } else {
            self.finish(auth);
        }
        Ok(())
    }

    fn finish(&mut self, auth: &dyn Authenticator) {
        self.state = ParseState::Finish;
        self.parse_post(auth);
        debug!(
            method = self.method.map(|m| m.as_str()),
            path = %self.path,
            version = %self.version,
            body_len = self.body.len(),
            "request parsed"
        );
    }

    fn parse_post(&mut self, auth: &dyn Authenticator) {
        if self.method != Some(Method::POST) || !self.is_form() {
            return;
        }
        self.post = parser::decode_form(&self.body);

        let is_login = match self.path.as_str() {
            LOGIN_PAGE => true,
            REGISTER_PAGE => false,
            _ => return,
        };

        let username = self.post("username").unwrap_or_default();
        let password = self.post("password").unwrap_or_default();
        let verified = if is_login {
            auth.login(username, password)
        } else {
            auth.register(username, password)
        };
        debug!(user = username, is_login, verified, "credential check");

        self.path = if verified { WELCOME_PAGE } else { ERROR_PAGE }.to_owned();
    }

    fn is_form(&self) -> bool {
        self.header("Content-Type")
            .and_then(|v| v.split(';').next())
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(FORM_URLENCODED))
    }
}

/// Maps `/` to the index page and appends `.html` to the well-known pages.
fn normalize_path(path: &str) -> String {
    if path == "/" {
        return "/index.html".to_owned();
    }
    if DEFAULT_HTML.contains(&path) {
        return format!("{path}.html");
    }
    path.to_owned()
}
