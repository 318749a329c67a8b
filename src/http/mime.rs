//! MIME type detection based on file suffix.

pub const DEFAULT_TYPE: &str = "application/octet-stream";

/// The `Content-type` for `path`, judged by the text after its last `.`.
pub fn content_type(path: &str) -> &'static str {
    let Some(idx) = path.rfind('.') else {
        return DEFAULT_TYPE;
    };
    match &path[idx..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => DEFAULT_TYPE,
    }
}
