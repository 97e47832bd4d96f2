//! Per-connection request state.
//!
//! An [`HttpRequest`] owns the client socket, accumulates the raw request
//! until the header terminator arrives, parses the request line and the
//! retained headers, and writes the prepared response back out. All socket
//! I/O is non-blocking; `WouldBlock` surfaces as the `NonBlocked` status so
//! the worker can re-arm readiness.

use crate::cache::buffer::ReadHandle;
use crate::errors::HttpError;
use crate::http::response::{RawResponse, ResponseData, Status};
use crate::http::types::{Method, RequestState, Version};
use crate::reader::stat::FileStat;
use memchr::memmem;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

const INITIAL_RECV_CAPACITY: usize = 1024;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Outcome of one `read` pass over a readable socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// The buffer now contains the full request head.
    End,
    /// The socket would block; wait for the next readable event.
    NonBlocked,
    /// Peer closed before completing the request head.
    Closed,
    Error,
}

/// Outcome of one `write` pass over a writable socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum WriteStatus {
    /// The whole response (header and body) is on the wire.
    End,
    /// The socket would block; wait for the next writable event.
    NonBlocked,
    Error,
}

/// Raw request bytes, grown geometrically as the client sends.
struct RecvBuffer {
    data: Vec<u8>,
    len: usize,
}

impl RecvBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            len: 0,
        }
    }

    /// Writable tail of the buffer, doubling capacity when full.
    fn spare_mut(&mut self) -> &mut [u8] {
        if self.len == self.data.len() {
            let grown = self.data.len() * 2;
            self.data.resize(grown, 0);
        }
        &mut self.data[self.len..]
    }

    fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Request line and retained headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

impl ParsedRequest {
    /// Parses a complete request head.
    ///
    /// The request line is split into exactly three tokens; method and
    /// version are matched as whole tokens. Only `Host` and `User-Agent`
    /// are retained; every other header is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, HttpError> {
        let end = memmem::find(raw, HEADER_TERMINATOR).ok_or(HttpError::Parse)?;
        let head = simdutf8::basic::from_utf8(&raw[..end]).map_err(|_| HttpError::Parse)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(HttpError::Parse)?;

        let mut tokens = request_line.split(' ');
        let method_token = tokens.next().ok_or(HttpError::Parse)?;
        let target = tokens.next().ok_or(HttpError::Parse)?;
        let version_token = tokens.next().ok_or(HttpError::Parse)?;
        if tokens.next().is_some() || target.is_empty() {
            return Err(HttpError::Parse);
        }

        let method = Method::from_token(method_token)?;
        let version = Version::from_token(version_token)?;

        if !target.starts_with('/') {
            return Err(HttpError::Parse);
        }

        let mut host = None;
        let mut user_agent = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("Host: ") {
                host = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("User-Agent: ") {
                user_agent = Some(value.to_string());
            }
        }

        Ok(Self {
            method,
            path: target.to_string(),
            version,
            host,
            user_agent,
        })
    }
}

/// One client connection moving through the worker state machine.
pub struct HttpRequest {
    stream: TcpStream,
    state: RequestState,
    recv: RecvBuffer,
    search_from: usize,
    parsed: Option<ParsedRequest>,
    response: Option<ResponseData>,
    raw: Option<RawResponse>,
}

impl HttpRequest {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            state: RequestState::Connect,
            recv: RecvBuffer::new(INITIAL_RECV_CAPACITY),
            search_from: 0,
            parsed: None,
            response: None,
            raw: None,
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn parsed(&self) -> Option<&ParsedRequest> {
        self.parsed.as_ref()
    }

    /// Drains the socket until the header terminator, `WouldBlock`, or an
    /// error. The readiness source is edge-triggered, so each pass reads
    /// until the socket is dry.
    pub(crate) fn read(&mut self) -> ReadStatus {
        loop {
            let spare = self.recv.spare_mut();
            match self.stream.read(spare) {
                Ok(0) => return ReadStatus::Closed,
                Ok(n) => {
                    self.recv.advance(n);
                    // Re-scan only the tail; the terminator may straddle
                    // the previous chunk boundary.
                    let start = self.search_from.saturating_sub(HEADER_TERMINATOR.len() - 1);
                    if memmem::find(&self.recv.filled()[start..], HEADER_TERMINATOR).is_some() {
                        return ReadStatus::End;
                    }
                    self.search_from = self.recv.len;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return ReadStatus::NonBlocked
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return ReadStatus::Error,
            }
        }
    }

    /// Parses the accumulated request head. Idempotent: once parsed,
    /// further calls succeed without re-parsing.
    pub(crate) fn parse(&mut self) -> Result<(), HttpError> {
        if self.parsed.is_some() {
            return Ok(());
        }
        self.parsed = Some(ParsedRequest::parse(self.recv.filled())?);
        Ok(())
    }

    pub(crate) fn replace_path(&mut self, path: &str) -> Result<(), HttpError> {
        let parsed = self.parsed.as_mut().ok_or(HttpError::NotParsed)?;
        parsed.path = path.to_string();
        Ok(())
    }

    pub(crate) fn prefix_path(&mut self, prefix: &str) -> Result<(), HttpError> {
        let parsed = self.parsed.as_mut().ok_or(HttpError::NotParsed)?;
        parsed.path.insert_str(0, prefix);
        Ok(())
    }

    /// Binds the content headers from a successful stat.
    pub(crate) fn fill_response_header(&mut self, stat: &FileStat) -> Result<(), HttpError> {
        let parsed = self.parsed.as_ref().ok_or(HttpError::NotParsed)?;
        self.response = Some(ResponseData::new(&parsed.path, stat));
        Ok(())
    }

    /// Attaches the cache-backed body for a GET response.
    pub(crate) fn add_body(&mut self, handle: ReadHandle) -> Result<(), HttpError> {
        let response = self.response.as_mut().ok_or(HttpError::ResponseNotFilled)?;
        response.body = Some(handle);
        Ok(())
    }

    /// Detaches the body handle, releasing the cache reference when the
    /// caller drops it. Used before deleting a failed cache entry.
    pub(crate) fn take_body(&mut self) -> Option<ReadHandle> {
        self.response.as_mut()?.body.take()
    }

    pub(crate) fn prepare_ok(&mut self) -> Result<(), HttpError> {
        let data = self.response.take().ok_or(HttpError::ResponseNotFilled)?;
        self.raw = Some(RawResponse::ok(data));
        Ok(())
    }

    pub(crate) fn prepare_forbidden(&mut self) {
        self.raw = Some(RawResponse::status_only(Status::Forbidden));
    }

    pub(crate) fn prepare_not_found(&mut self) {
        self.raw = Some(RawResponse::status_only(Status::NotFound));
    }

    pub(crate) fn prepare_method_not_allowed(&mut self) {
        self.raw = Some(RawResponse::status_only(Status::MethodNotAllowed));
    }

    /// Writes header bytes first, then body bytes under the body's shared
    /// lock. Drains until complete or `WouldBlock`.
    pub(crate) fn write(&mut self) -> WriteStatus {
        let Some(raw) = self.raw.as_mut() else {
            return WriteStatus::Error;
        };
        let RawResponse {
            ref header,
            ref body,
            ref mut header_written,
            ref mut body_written,
        } = *raw;

        while *header_written < header.len() {
            match self.stream.write(&header[*header_written..]) {
                Ok(0) => return WriteStatus::Error,
                Ok(n) => *header_written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return WriteStatus::NonBlocked
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return WriteStatus::Error,
            }
        }

        if let Some(handle) = body {
            // Blocks until an in-flight fill of this entry releases the
            // writer lock, so a partially-filled buffer is never served.
            let guard = handle.lock();
            let bytes = guard.bytes();
            while *body_written < bytes.len() {
                match self.stream.write(&bytes[*body_written..]) {
                    Ok(0) => return WriteStatus::Error,
                    Ok(n) => *body_written += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return WriteStatus::NonBlocked
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return WriteStatus::Error,
                }
            }
        }

        WriteStatus::End
    }
}
