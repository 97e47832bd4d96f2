//! Core HTTP protocol types.

use crate::errors::HttpError;

// METHOD

/// The two methods this server implements. Anything else is answered with
/// `405 Method Not Allowed` by the worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    /// Matches a whole request-line token. `GETX` is not `GET`.
    pub(crate) fn from_token(token: &str) -> Result<Self, HttpError> {
        match token {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            _ => Err(HttpError::UnsupportedMethod),
        }
    }
}

// VERSION

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub(crate) fn from_token(token: &str) -> Result<Self, HttpError> {
        match token {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(HttpError::UnsupportedVersion),
        }
    }
}

// REQUEST STATE

/// Connection state machine driven by the worker loop.
///
/// `Connect → Read → [Write | WaitingForBody → Write] → Done`, with
/// `Error` reachable from anywhere. `WaitingForBody` connections sit in
/// neither readiness set; a reader-pool completion moves them to `Write`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestState {
    Connect,
    Read,
    WaitingForBody,
    Write,
    Done,
    Error,
}

// CONTENT TYPE

/// Resolves a `Content-Type` from the last `.` extension of the path.
/// Unknown extensions are served as `application/octet-stream`, paths
/// without an extension as `text/plain`.
pub(crate) fn content_type_for(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return "text/plain";
    };

    match &path[dot..] {
        ".html" => "text/html;charset=utf-8",
        ".css" => "text/css",
        ".json" => "application/json",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Ok(Method::Get)),
            ("HEAD",    Ok(Method::Head)),

            ("GETX",    Err(HttpError::UnsupportedMethod)),
            ("GE",      Err(HttpError::UnsupportedMethod)),
            ("get",     Err(HttpError::UnsupportedMethod)),
            ("POST",    Err(HttpError::UnsupportedMethod)),
            ("DELETE",  Err(HttpError::UnsupportedMethod)),
            ("",        Err(HttpError::UnsupportedMethod)),
        ];

        for (token, expected) in cases {
            assert_eq!(Method::from_token(token), expected, "token: {token:?}");
        }
    }

    #[test]
    fn version_tokens() {
        #[rustfmt::skip]
        let cases = [
            ("HTTP/1.0",  Ok(Version::Http10)),
            ("HTTP/1.1",  Ok(Version::Http11)),

            ("HTTP/2.0",  Err(HttpError::UnsupportedVersion)),
            ("HTTP/0.9",  Err(HttpError::UnsupportedVersion)),
            ("HTTP/1.12", Err(HttpError::UnsupportedVersion)),
            ("http/1.1",  Err(HttpError::UnsupportedVersion)),
            ("",          Err(HttpError::UnsupportedVersion)),
        ];

        for (token, expected) in cases {
            assert_eq!(Version::from_token(token), expected, "token: {token:?}");
        }
    }

    #[test]
    fn content_types_by_extension() {
        #[rustfmt::skip]
        let cases = [
            ("/index.html",        "text/html;charset=utf-8"),
            ("/styles/site.css",   "text/css"),
            ("/api/data.json",     "application/json"),
            ("/img/photo.jpg",     "image/jpeg"),
            ("/img/photo.jpeg",    "image/jpeg"),
            ("/img/logo.png",      "image/png"),
            ("/img/anim.gif",      "image/gif"),
            ("/img/icon.svg",      "image/svg+xml"),
            ("/favicon.ico",       "image/x-icon"),

            ("/archive.tar.gz",    "application/octet-stream"),
            ("/program.exe",       "application/octet-stream"),
            ("/README",            "text/plain"),
            ("/some/dir/LICENSE",  "text/plain"),
        ];

        for (path, expected) in cases {
            assert_eq!(content_type_for(path), expected, "path: {path:?}");
        }
    }
}
