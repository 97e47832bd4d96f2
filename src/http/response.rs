//! Response assembly: status lines, content headers, raw bytes.
//!
//! Error responses are header-only (status line plus the terminating blank
//! line); only `200 OK` carries the content headers and a body. The status
//! line always answers as `HTTP/1.1` regardless of the request version.

use crate::cache::buffer::ReadHandle;
use crate::http::types::content_type_for;
use crate::reader::stat::FileStat;
use std::time::SystemTime;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Forbidden,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    pub(crate) const fn line(self) -> &'static str {
        match self {
            Status::Ok => "HTTP/1.1 200 OK\r\n",
            Status::Forbidden => "HTTP/1.1 403 Forbidden\r\n",
            Status::NotFound => "HTTP/1.1 404 Not Found\r\n",
            Status::MethodNotAllowed => "HTTP/1.1 405 Method Not Allowed\r\n",
        }
    }
}

/// Content headers bound after a successful stat, before the raw header
/// bytes are materialized. The body handle is attached here for GET hits.
pub(crate) struct ResponseData {
    pub(crate) content_type: &'static str,
    pub(crate) content_length: u64,
    pub(crate) date: SystemTime,
    pub(crate) last_modified: SystemTime,
    pub(crate) body: Option<ReadHandle>,
}

impl ResponseData {
    pub(crate) fn new(path: &str, stat: &FileStat) -> Self {
        Self {
            content_type: content_type_for(path),
            content_length: stat.len,
            date: SystemTime::now(),
            last_modified: stat.modified,
            body: None,
        }
    }
}

/// Fully materialized response: header bytes, an optional cache-backed
/// body, and per-phase write offsets.
pub(crate) struct RawResponse {
    pub(crate) header: Vec<u8>,
    pub(crate) body: Option<ReadHandle>,
    pub(crate) header_written: usize,
    pub(crate) body_written: usize,
}

impl RawResponse {
    /// Header-only response for the error statuses.
    pub(crate) fn status_only(status: Status) -> Self {
        let mut header = String::with_capacity(64);
        header.push_str(status.line());
        header.push_str("\r\n");

        Self {
            header: header.into_bytes(),
            body: None,
            header_written: 0,
            body_written: 0,
        }
    }

    /// `200 OK` with content headers; takes the body handle out of the
    /// response data (absent for HEAD).
    pub(crate) fn ok(mut data: ResponseData) -> Self {
        let mut header = String::with_capacity(256);
        header.push_str(Status::Ok.line());

        header.push_str("Content-Type: ");
        header.push_str(data.content_type);
        header.push_str("\r\n");

        header.push_str("Content-Length: ");
        header.push_str(&data.content_length.to_string());
        header.push_str("\r\n");

        header.push_str("Date: ");
        header.push_str(&httpdate::fmt_http_date(data.date));
        header.push_str("\r\n");

        header.push_str("Last-Modified: ");
        header.push_str(&httpdate::fmt_http_date(data.last_modified));
        header.push_str("\r\n");

        header.push_str("\r\n");

        Self {
            header: header.into_bytes(),
            body: data.body.take(),
            header_written: 0,
            body_written: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::stat::FileKind;
    use std::time::Duration;

    fn stat(len: u64) -> FileStat {
        FileStat {
            len,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777),
            kind: FileKind::Regular,
        }
    }

    #[test]
    fn ok_response_headers() {
        let data = ResponseData::new("/index.html", &stat(1234));
        let raw = RawResponse::ok(data);
        let text = String::from_utf8(raw.header).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html;charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 1234\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.contains("Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_responses_are_header_only() {
        #[rustfmt::skip]
        let cases = [
            (Status::Forbidden,        "HTTP/1.1 403 Forbidden\r\n\r\n"),
            (Status::NotFound,         "HTTP/1.1 404 Not Found\r\n\r\n"),
            (Status::MethodNotAllowed, "HTTP/1.1 405 Method Not Allowed\r\n\r\n"),
        ];

        for (status, expected) in cases {
            let raw = RawResponse::status_only(status);
            assert_eq!(raw.header, expected.as_bytes());
            assert!(raw.body.is_none());
        }
    }
}
