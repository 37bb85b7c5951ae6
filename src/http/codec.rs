//! HTTP/1.x request decoding from a raw byte stream.
//!
//! # Responsibilities
//! - Read one request head and parse it with `httparse`
//! - Read the body framed by `Content-Length` or chunked transfer coding
//! - Distinguish a clean end of stream from a truncated request
//!
//! # Design Decisions
//! - Head and body sizes are bounded; oversized requests are decode errors
//! - Bodies are buffered; the pipeline forwards them as a single `Bytes`

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 1024;

/// Errors raised while decoding a request.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("I/O error while reading request: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed in the middle of a request")]
    UnexpectedEof,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl From<httparse::Error> for DecodeError {
    fn from(err: httparse::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Decode the next request from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new request starts.
pub async fn read_request<R>(
    reader: &mut R,
    max_body_bytes: usize,
) -> Result<Option<Request<Bytes>>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_head(reader).await? else {
        return Ok(None);
    };

    let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_slots);
    if parsed.parse(&head)?.is_partial() {
        return Err(DecodeError::Malformed("incomplete request head".into()));
    }

    let method = parsed
        .method
        .ok_or_else(|| DecodeError::Malformed("missing method".into()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes()).map_err(|e| DecodeError::Malformed(e.to_string()))
        })?;
    let uri: Uri = parsed
        .path
        .ok_or_else(|| DecodeError::Malformed("missing request target".into()))?
        .parse()
        .map_err(|e: axum::http::uri::InvalidUri| DecodeError::Malformed(e.to_string()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        headers.append(name, value);
    }

    let body = if is_chunked(&headers) {
        read_chunked_body(reader, max_body_bytes).await?
    } else if let Some(length) = declared_length(&headers)? {
        read_sized_body(reader, length, max_body_bytes).await?
    } else {
        Bytes::new()
    };

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;
    Ok(Some(request))
}

/// Read bytes up to and including the blank line that ends the head.
async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let budget = (MAX_HEAD_BYTES + 1 - start) as u64;
        let read = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;
        if read == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(DecodeError::UnexpectedEof)
            };
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(DecodeError::HeadTooLarge(MAX_HEAD_BYTES));
        }

        let line = &head[start..];
        let blank = line == b"\r\n" || line == b"\n";
        if blank && start == 0 {
            // stray line breaks between pipelined requests
            head.clear();
            continue;
        }
        if blank {
            return Ok(Some(head));
        }
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn declared_length(headers: &HeaderMap) -> Result<Option<usize>, DecodeError> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| DecodeError::Malformed("invalid content-length".into())),
    }
}

async fn read_sized_body<R>(
    reader: &mut R,
    length: usize,
    max_body_bytes: usize,
) -> Result<Bytes, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    if length > max_body_bytes {
        return Err(DecodeError::BodyTooLarge(max_body_bytes));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(eof_to_decode)?;
    Ok(Bytes::from(body))
}

async fn read_chunked_body<R>(reader: &mut R, max_body_bytes: usize) -> Result<Bytes, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| DecodeError::Malformed(format!("invalid chunk size {:?}", size_field)))?;

        if size == 0 {
            // trailers are read and discarded
            while !read_line(reader).await?.is_empty() {}
            return Ok(Bytes::from(body));
        }
        if size > max_body_bytes.saturating_sub(body.len()) {
            return Err(DecodeError::BodyTooLarge(max_body_bytes));
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await.map_err(eof_to_decode)?;
        if !read_line(reader).await?.is_empty() {
            return Err(DecodeError::Malformed("missing CRLF after chunk".into()));
        }
    }
}

/// Read one line, without its terminator.
async fn read_line<R>(reader: &mut R) -> Result<String, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let budget = (MAX_CHUNK_LINE_BYTES + 1) as u64;
    let read = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(DecodeError::UnexpectedEof);
    }
    if line.len() > MAX_CHUNK_LINE_BYTES {
        return Err(DecodeError::Malformed("chunk line too long".into()));
    }
    if !line.ends_with(b"\n") {
        return Err(DecodeError::UnexpectedEof);
    }
    let line = String::from_utf8(line).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn eof_to_decode(err: std::io::Error) -> DecodeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::UnexpectedEof
    } else {
        DecodeError::Io(err)
    }
}
