use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stream closed by peer")]
    Closed,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn content_length(&self) -> Result<usize, FramingError> {
        if let Some(coding) = self.get("Transfer-Encoding") {
            return Err(FramingError::Malformed(format!(
                "unsupported transfer-encoding: {coding}"
            )));
        }
        let Some(raw) = self.get("Content-Length") else {
            return Ok(0);
        };
        let len: usize = raw
            .trim()
            .parse()
            .map_err(|_| FramingError::Malformed(format!("invalid content-length: {raw}")))?;
        if len > MAX_BODY_BYTES {
            return Err(FramingError::Malformed(format!(
                "content-length {len} exceeds {MAX_BODY_BYTES}"
            )));
        }
        Ok(len)
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl InboundRequest {
    /// Request target without any query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl InboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An outgoing request or response, serialised in one piece so it reaches
/// the socket with a single write.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    start_line: String,
    headers: Headers,
    body: Vec<u8>,
}

impl OutboundMessage {
    pub fn request(method: &str, path: &str) -> Self {
        Self {
            start_line: format!("{method} {path} {HTTP_VERSION}"),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn response(status: u16, reason: &str) -> Self {
        Self {
            start_line: format!("{HTTP_VERSION} {status} {reason}"),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.headers.insert(name, value.to_string());
        self
    }

    /// Attaches `body` and appends the matching `Content-Length` header.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.headers.insert("Content-Length", body.len().to_string());
        self.body = body;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.start_line.len() + 128 + self.body.len());
        out.extend_from_slice(self.start_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub async fn write_message<W>(writer: &mut W, message: &OutboundMessage) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request<R>(reader: &mut R) -> Result<InboundRequest, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let (start_line, headers) = read_head(reader).await?;
    let mut parts = start_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(FramingError::Malformed(format!(
            "invalid request line: {start_line}"
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(FramingError::Malformed(format!(
            "invalid request version: {version}"
        )));
    }

    let body = read_body(reader, headers.content_length()?).await?;
    Ok(InboundRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body,
    })
}

pub async fn read_response<R>(reader: &mut R) -> Result<InboundResponse, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let (start_line, headers) = read_head(reader).await?;
    let mut parts = start_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(FramingError::Malformed(format!(
            "invalid status line: {start_line}"
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .filter(|code| (100..600).contains(code))
        .ok_or_else(|| FramingError::Malformed(format!("invalid status line: {start_line}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    // Informational, 204 and 304 responses never carry a body.
    let body = if status < 200 || status == 204 || status == 304 {
        Bytes::new()
    } else {
        read_body(reader, headers.content_length()?).await?
    };

    Ok(InboundResponse {
        version: version.to_string(),
        status,
        reason,
        headers,
        body,
    })
}

async fn read_head<R>(reader: &mut R) -> Result<(String, Headers), FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;

    // Tolerate stray CRLFs between messages.
    let start_line = loop {
        match read_line(reader, &mut consumed).await? {
            None => return Err(FramingError::Closed),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut headers = Headers::new();
    loop {
        let line = read_line(reader, &mut consumed)
            .await?
            .ok_or_else(|| FramingError::Malformed("stream ended inside message head".into()))?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(FramingError::Malformed(format!(
                "more than {MAX_HEADERS} headers"
            )));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FramingError::Malformed(format!("invalid header line: {line}")))?;
        headers.insert(name.trim(), value.trim());
    }

    Ok((start_line, headers))
}

/// Reads one CRLF/LF terminated line, without its terminator. `None` on a
/// clean end of stream.
async fn read_line<R>(reader: &mut R, consumed: &mut usize) -> Result<Option<String>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = MAX_HEAD_BYTES.saturating_sub(*consumed);
    if remaining == 0 {
        return Err(FramingError::HeadTooLarge(MAX_HEAD_BYTES));
    }

    let mut raw = Vec::new();
    let read = (&mut *reader)
        .take(remaining as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    *consumed += read;

    if read == 0 {
        return Ok(None);
    }
    if raw.last() != Some(&b'\n') {
        if read == remaining {
            return Err(FramingError::HeadTooLarge(MAX_HEAD_BYTES));
        }
        return Err(FramingError::Malformed("stream ended inside message head".into()));
    }

    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| FramingError::Malformed("message head is not utf-8".into()))
}

async fn read_body<R>(reader: &mut R, len: usize) -> Result<Bytes, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FramingError::Malformed(format!("stream ended inside {len} byte body"))
        } else {
            FramingError::Io(err)
        }
    })?;
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test_timeout::tokio_timeout_test(5)]
    async fn reads_pipelined_requests_with_bodies() {
        let wire = b"PUT /slideshows/1?x=1 HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello\
GET /slideshows/1/assets/1 HTTP/1.1\r\nAccept: application/x-apple-binary-plist\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);

        let first = read_request(&mut reader).await.expect("first request");
        assert_eq!(first.method, "PUT");
        assert_eq!(first.path(), "/slideshows/1");
        assert_eq!(first.headers.get("Content-Length"), Some("5"));
        assert_eq!(&first.body[..], b"hello");

        let second = read_request(&mut reader).await.expect("second request");
        assert_eq!(second.method, "GET");
        assert_eq!(second.path(), "/slideshows/1/assets/1");
        assert!(second.body.is_empty());

        assert!(matches!(
            read_request(&mut reader).await,
            Err(FramingError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn switching_protocols_response_has_no_body() {
        let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: PTTH/1.0\r\nConnection: Upgrade\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let response = read_response(&mut reader).await.expect("response");
        assert_eq!(response.status, 101);
        assert_eq!(response.reason, "Switching Protocols");
        assert_eq!(response.headers.get("connection"), Some("Upgrade"));
        assert!(!response.is_success());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn rejects_malformed_heads() {
        let mut reader = BufReader::new(&b"NONSENSE\r\n\r\n"[..]);
        assert!(matches!(
            read_request(&mut reader).await,
            Err(FramingError::Malformed(_))
        ));

        let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n"[..]);
        assert!(matches!(
            read_request(&mut reader).await,
            Err(FramingError::Malformed(_))
        ));

        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort"[..]);
        assert!(matches!(
            read_response(&mut reader).await,
            Err(FramingError::Malformed(_))
        ));

        let mut reader =
            BufReader::new(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
        assert!(matches!(
            read_response(&mut reader).await,
            Err(FramingError::Malformed(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn oversized_head_is_rejected() {
        let mut wire = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        wire.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        wire.extend_from_slice(b"\r\n\r\n");
        let mut reader = BufReader::new(&wire[..]);
        assert!(matches!(
            read_request(&mut reader).await,
            Err(FramingError::HeadTooLarge(_))
        ));
    }

    #[test_timeout::timeout]
    fn outbound_message_serialises_in_order() {
        let message = OutboundMessage::response(200, "OK")
            .header("Content-Type", "application/x-apple-binary-plist")
            .body(b"abc".to_vec());
        assert_eq!(
            message.to_bytes(),
            b"HTTP/1.1 200 OK\r\nContent-Type: application/x-apple-binary-plist\r\nContent-Length: 3\r\n\r\nabc"
                .to_vec()
        );

        let request = OutboundMessage::request("POST", "/reverse").header("Content-Length", 0);
        assert_eq!(
            request.to_bytes(),
            b"POST /reverse HTTP/1.1\r\nContent-Length: 0\r\n\r\n".to_vec()
        );
    }
}
