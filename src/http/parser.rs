use std::collections::HashMap;

use thiserror::Error;

use crate::http::request::Method;

/// Hard failures while parsing a request. Running out of input is not an
/// error; it is reported as [`ParseStatus::Incomplete`](crate::http::request::ParseStatus).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown method `{0}`")]
    InvalidMethod(String),
    #[error("request target must start with '/'")]
    InvalidPath,
    #[error("unsupported protocol version `{0}`")]
    InvalidVersion(String),
    #[error("malformed header line")]
    InvalidHeader,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported transfer encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("body of {len} bytes exceeds {limit} bytes")]
    BodyTooLarge { len: usize, limit: usize },
}

/// Splits `METHOD SP PATH SP HTTP/VERSION`.
pub fn parse_request_line(line: &str) -> Result<(Method, &str, &str), ParseError> {
    let mut parts = line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || method_str.is_empty() || path.is_empty() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str)
        .ok_or_else(|| ParseError::InvalidMethod(method_str.to_owned()))?;
    if !path.starts_with('/') {
        return Err(ParseError::InvalidPath);
    }
    if !version.starts_with("HTTP/") || version.len() == "HTTP/".len() {
        return Err(ParseError::InvalidVersion(version.to_owned()));
    }

    Ok((method, path, version))
}

/// Splits `key: value`, trimming whitespace around both.
pub fn parse_header_line(line: &str) -> Result<(&str, &str), ParseError> {
    let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(ParseError::InvalidHeader);
    }
    Ok((key, value.trim()))
}

/// Decodes an `application/x-www-form-urlencoded` body. `+` becomes a space
/// and `%XX` escapes become bytes; a repeated key keeps its last value.
pub fn decode_form(body: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let (method, path, version) = parse_request_line("GET / HTTP/1.1").unwrap();

        assert_eq!(method, Method::GET);
        assert_eq!(path, "/");
        assert_eq!(version, "HTTP/1.1");
    }

    #[test]
    fn request_line_needs_three_parts() {
        assert_eq!(parse_request_line("GET /"), Err(ParseError::InvalidRequest));
        assert_eq!(parse_request_line("GET / HTTP/1.1 extra"), Err(ParseError::InvalidRequest));
        assert_eq!(parse_request_line("GET  HTTP/1.1"), Err(ParseError::InvalidRequest));
    }

    #[test]
    fn request_line_checks_version_prefix() {
        assert!(matches!(parse_request_line("GET / FTP/1.0"), Err(ParseError::InvalidVersion(_))));
        assert!(matches!(parse_request_line("GET / HTTP/"), Err(ParseError::InvalidVersion(_))));
    }

    #[test]
    fn header_value_may_contain_colons() {
        let (key, value) = parse_header_line("Host: 127.0.0.1:8080").unwrap();
        assert_eq!(key, "Host");
        assert_eq!(value, "127.0.0.1:8080");
    }

    #[test]
    fn form_decoding_handles_plus_and_escapes() {
        let form = decode_form("username=jo+doe&password=p%40ss%21&empty=");

        assert_eq!(form["username"], "jo doe");
        assert_eq!(form["password"], "p@ss!");
        assert_eq!(form["empty"], "");
    }
}
