//! Uniform response sink for the request processor.
//!
//! # Responsibilities
//! - Emit status, headers and body the same way for plain and tunneled requests
//! - `ChannelWriter`: feeds the per-request hyper/axum response channel
//! - `RawWriter`: serializes HTTP/1.1 responses onto a live byte stream
//!
//! # Design Decisions
//! - Headers set via `set_header` always precede the body
//! - `write` drains the body completely or fails with an I/O error
//! - `error` never fails the caller; delivery problems are only logged
//! - `RawWriter` never closes the stream; further requests are read from it

use std::future::Future;
use std::io;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::http::headers;

const CHUNK_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Body handed to a writer.
pub enum ResponseBody<'a> {
    /// No body at all (HEAD responses).
    Empty,
    /// Stream drained into the response.
    Stream(&'a mut (dyn AsyncRead + Send + Unpin)),
}

/// Sink for one HTTP response.
pub trait ResponseWriter: Send {
    /// Replace the headers sent with the next response.
    fn set_header(&mut self, headers: HeaderMap);

    /// Send status, previously set headers and `body`.
    fn write(
        &mut self,
        status: StatusCode,
        body: ResponseBody<'_>,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Send a minimal plain-text error response.
    fn error(
        &mut self,
        err: &(dyn std::error::Error + Send + Sync),
        status: StatusCode,
    ) -> impl Future<Output = ()> + Send;
}

fn error_text(err: &(dyn std::error::Error + Send + Sync)) -> String {
    format!("{}\n", err)
}

fn error_headers(len: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers
}

/// Writer bound to the standard per-request response channel.
///
/// The response head is delivered through a oneshot as soon as `write` starts;
/// the body follows through a bounded channel, so large bodies are streamed.
pub struct ChannelWriter {
    headers: HeaderMap,
    response_tx: Option<oneshot::Sender<Response<Body>>>,
}

impl ChannelWriter {
    /// Create a writer and the receiver that yields its response.
    pub fn new() -> (Self, oneshot::Receiver<Response<Body>>) {
        let (response_tx, response_rx) = oneshot::channel();
        (
            Self {
                headers: HeaderMap::new(),
                response_tx: Some(response_tx),
            },
            response_rx,
        )
    }

    fn send(&mut self, response: Response<Body>) -> io::Result<()> {
        let tx = self
            .response_tx
            .take()
            .ok_or_else(|| io::Error::other("response already sent"))?;
        tx.send(response)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl ResponseWriter for ChannelWriter {
    fn set_header(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    async fn write(&mut self, status: StatusCode, body: ResponseBody<'_>) -> io::Result<()> {
        let headers = std::mem::take(&mut self.headers);

        let reader = match body {
            ResponseBody::Empty => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                return self.send(response);
            }
            ResponseBody::Stream(reader) => reader,
        };

        let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let chunks = futures_util::stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let mut response = Response::new(Body::from_stream(chunks));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        self.send(response)?;

        loop {
            let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
            match reader.read_buf(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    if chunk_tx.send(Ok(buf.freeze())).await.is_err() {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
                    }
                }
                Err(err) => {
                    // abort the response body so the client sees a truncated transfer
                    let _ = chunk_tx.send(Err(io::Error::new(err.kind(), err.to_string()))).await;
                    return Err(err);
                }
            }
        }
    }

    async fn error(&mut self, err: &(dyn std::error::Error + Send + Sync), status: StatusCode) {
        let text = error_text(err);
        let headers = error_headers(text.len());
        let mut response = Response::new(Body::from(text));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        if let Err(e) = self.send(response) {
            tracing::debug!(error = %e, status = %status, "Could not deliver error response");
        }
    }
}

/// Writer bound to a raw byte stream, e.g. a TLS-terminated CONNECT tunnel.
pub struct RawWriter<'a, S> {
    stream: &'a mut S,
    headers: HeaderMap,
}

impl<'a, S> RawWriter<'a, S>
where
    S: AsyncWrite + Send + Unpin,
{
    pub fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            headers: HeaderMap::new(),
        }
    }

    async fn write_chunked(
        &mut self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<()> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.stream.write_all(format!("{:x}\r\n", n).as_bytes()).await?;
            self.stream.write_all(&buf[..n]).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.write_all(b"0\r\n\r\n").await
    }
}

/// Serialize a response head (status line, headers, blank line).
fn encode_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl<'a, S> ResponseWriter for RawWriter<'a, S>
where
    S: AsyncWrite + Send + Unpin,
{
    fn set_header(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    async fn write(&mut self, status: StatusCode, body: ResponseBody<'_>) -> io::Result<()> {
        let mut headers = headers::remove_hop_by_hop(&std::mem::take(&mut self.headers));
        let length = content_length(&headers);

        match body {
            ResponseBody::Empty => {
                self.stream.write_all(&encode_head(status, &headers)).await?;
            }
            ResponseBody::Stream(reader) => match length {
                Some(expected) => {
                    self.stream.write_all(&encode_head(status, &headers)).await?;
                    let mut limited = reader.take(expected);
                    let copied = tokio::io::copy(&mut limited, &mut *self.stream).await?;
                    if copied != expected {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("body ended after {} of {} bytes", copied, expected),
                        ));
                    }
                }
                None => {
                    headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    self.stream.write_all(&encode_head(status, &headers)).await?;
                    self.write_chunked(reader).await?;
                }
            },
        }

        self.stream.flush().await
    }

    async fn error(&mut self, err: &(dyn std::error::Error + Send + Sync), status: StatusCode) {
        self.headers.clear();
        let text = error_text(err);
        let head = encode_head(status, &error_headers(text.len()));

        let result = async {
            self.stream.write_all(&head).await?;
            self.stream.write_all(text.as_bytes()).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, status = %status, "Could not deliver error response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[tokio::test]
    async fn raw_writer_uses_content_length_when_known() {
        let mut out = Vec::new();
        let mut body = Cursor::new(b"hello".to_vec());
        {
            let mut writer = RawWriter::new(&mut out);
            writer.set_header(headers(&[("content-length", "5"), ("etag", "\"abc\"")]));
            writer.write(StatusCode::OK, ResponseBody::Stream(&mut body)).await.unwrap();
        }

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("etag: \"abc\"\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn raw_writer_chunks_bodies_of_unknown_length() {
        let mut out = Vec::new();
        let mut body = Cursor::new(b"streamed".to_vec());
        {
            let mut writer = RawWriter::new(&mut out);
            writer.set_header(headers(&[("transfer-encoding", "gzip, chunked")]));
            writer.write(StatusCode::OK, ResponseBody::Stream(&mut body)).await.unwrap();
        }

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("transfer-encoding").count(), 1);
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n8\r\nstreamed\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn raw_writer_sends_only_the_head_for_empty_bodies() {
        let mut out = Vec::new();
        {
            let mut writer = RawWriter::new(&mut out);
            writer.set_header(headers(&[("content-length", "1024")]));
            writer.write(StatusCode::OK, ResponseBody::Empty).await.unwrap();
        }

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("content-length: 1024\r\n\r\n"));
    }

    #[tokio::test]
    async fn raw_writer_rejects_short_bodies() {
        let mut out = Vec::new();
        let mut body = Cursor::new(b"abc".to_vec());
        let mut writer = RawWriter::new(&mut out);
        writer.set_header(headers(&[("content-length", "10")]));

        let err = writer
            .write(StatusCode::OK, ResponseBody::Stream(&mut body))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn raw_writer_error_is_a_complete_response() {
        let mut out = Vec::new();
        {
            let mut writer = RawWriter::new(&mut out);
            let err = io::Error::other("upstream down");
            writer.error(&err, StatusCode::BAD_GATEWAY).await;
        }

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("content-length: 14\r\n"));
        assert!(text.ends_with("\r\n\r\nupstream down\n"));
    }

    #[tokio::test]
    async fn channel_writer_streams_the_body() {
        let (mut writer, response_rx) = ChannelWriter::new();
        let mut body = Cursor::new(b"cached body".to_vec());

        let write = tokio::spawn(async move {
            writer.set_header(headers(&[("etag", "\"v1\"")]));
            writer.write(StatusCode::OK, ResponseBody::Stream(&mut body)).await
        });

        let response = response_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("etag").unwrap(), "\"v1\"");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"cached body");
        write.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn channel_writer_reports_errors_with_status() {
        let (mut writer, response_rx) = ChannelWriter::new();
        let err = io::Error::other("cache backend failed");
        writer.error(&err, StatusCode::INTERNAL_SERVER_ERROR).await;

        let response = response_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"cache backend failed\n");
    }

    #[tokio::test]
    async fn channel_writer_sends_one_response_only() {
        let (mut writer, _response_rx) = ChannelWriter::new();
        writer.write(StatusCode::NO_CONTENT, ResponseBody::Empty).await.unwrap();
        assert!(writer.write(StatusCode::OK, ResponseBody::Empty).await.is_err());
    }
}
