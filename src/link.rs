//! Peer link transport.
//!
//! Frames follow a STOMP-like layout: a command line, `key:value` header
//! lines, a blank line, then the body terminated by a NUL byte. Every
//! outbound `MESSAGE` carries a `receipt` header which the peer answers with
//! `RECEIPT` (accepted) or `ERROR` (rejected). Inbound requests arrive as
//! `SEND` frames with a JSON dictionary body.

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::message::Dictionary;

/// Message-oriented channel to the peer device.
pub trait PeerLink: Send + Sync + 'static {
    /// One delivery attempt. `Ok` means the peer acknowledged the message.
    fn deliver(&self, dict: &Dictionary) -> impl Future<Output = Result<(), LinkError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub fn encode_frame(command: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + body.len() + 64);
    out.extend_from_slice(command.as_bytes());
    out.push(b'\n');
    for (key, value) in headers {
        out.extend_from_slice(format!("{}:{}\n", key, value).as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("content-length:{}\n", body.len()).as_bytes());
    }
    out.push(b'\n');
    out.extend_from_slice(body);
    out.push(0);
    out
}

/// Largest frame body accepted from the peer.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Read one frame. Blank lines between frames are skipped.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, LinkError>
where
    R: AsyncBufRead + Unpin,
{
    // 1. Command
    let mut command = String::new();
    loop {
        command.clear();
        let bytes = reader.read_line(&mut command).await?;
        if bytes == 0 {
            return Err(LinkError::Closed);
        }
        // Trailing NULs from the previous frame count as padding.
        if command.trim_matches(|c: char| c.is_whitespace() || c == '\0').is_empty() {
            continue;
        }
        break;
    }
    let command = command
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string();

    // 2. Headers
    let mut headers = HashMap::new();
    let mut content_length = None;
    loop {
        let mut header_line = String::new();
        let bytes = reader.read_line(&mut header_line).await?;
        if bytes == 0 {
            return Err(LinkError::Closed);
        }
        let trimmed = header_line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            let key = k.trim().to_lowercase();
            let val = v.trim().to_string();
            if key == "content-length" {
                content_length = val.parse::<usize>().ok();
            }
            headers.insert(key, val);
        }
    }

    // 3. Body, then the NUL terminator
    let body = match content_length {
        Some(len) if len > MAX_FRAME_BYTES => return Err(LinkError::FrameTooLarge(len)),
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            let mut null_byte = [0u8; 1];
            reader.read_exact(&mut null_byte).await?;
            if null_byte[0] != 0 {
                warn!(command = %command, "Frame body not NUL terminated");
            }
            body
        }
        None => {
            let limit = MAX_FRAME_BYTES as u64 + 1;
            let mut body = Vec::new();
            (&mut *reader).take(limit).read_until(0, &mut body).await?;
            if body.last() == Some(&0) {
                body.pop();
            } else if body.len() as u64 >= limit {
                return Err(LinkError::FrameTooLarge(body.len()));
            }
            body
        }
    };

    Ok(Frame {
        command,
        headers,
        body,
    })
}

/// What the reader loop should do with a frame after the link has seen it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready,
    Request(Dictionary),
}

struct LinkInner<W> {
    writer: Mutex<W>,
    pending: DashMap<u64, oneshot::Sender<Result<(), String>>>,
    next_receipt: AtomicU64,
    ack_timeout: Duration,
}

/// Framed link over any byte stream, with receipt tracking.
pub struct FramedLink<W> {
    inner: Arc<LinkInner<W>>,
}

impl<W> Clone for FramedLink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> FramedLink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, ack_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                writer: Mutex::new(writer),
                pending: DashMap::new(),
                next_receipt: AtomicU64::new(0),
                ack_timeout,
            }),
        }
    }

    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Settle receipts and surface anything the relay has to act on.
    pub fn handle_frame(&self, frame: Frame) -> Option<Inbound> {
        match frame.command.as_str() {
            "CONNECTED" => Some(Inbound::Ready),
            "RECEIPT" => {
                self.settle(&frame, Ok(()));
                None
            }
            "ERROR" => {
                let reason = frame
                    .headers
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                self.settle(&frame, Err(reason));
                None
            }
            "SEND" => match serde_json::from_slice::<Dictionary>(&frame.body) {
                Ok(dict) => Some(Inbound::Request(dict)),
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable request");
                    None
                }
            },
            other => {
                debug!(command = other, "Ignoring frame");
                None
            }
        }
    }

    fn settle(&self, frame: &Frame, outcome: Result<(), String>) {
        let Some(receipt) = frame
            .headers
            .get("receipt-id")
            .and_then(|id| id.parse::<u64>().ok())
        else {
            warn!(command = %frame.command, "Frame without a usable receipt-id");
            return;
        };
        match self.inner.pending.remove(&receipt) {
            Some((_, waiter)) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(receipt, "Late receipt for settled message"),
        }
    }

    /// Fail every outstanding delivery, e.g. once the connection is gone.
    pub fn close(&self) {
        self.inner.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}

impl<W> PeerLink for FramedLink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn deliver(&self, dict: &Dictionary) -> Result<(), LinkError> {
        let receipt = self.inner.next_receipt.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(dict)?;
        let frame = encode_frame("MESSAGE", &[("receipt", receipt.to_string())], &body);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(receipt, tx);
        if let Err(e) = self.write_frame(&frame).await {
            self.inner.pending.remove(&receipt);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.inner.ack_timeout, rx).await;
        self.inner.pending.remove(&receipt);
        match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(LinkError::Rejected { receipt, reason }),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::AckTimeout(receipt)),
        }
    }
}

/// Open a TCP connection to the peer bridge and announce ourselves.
pub async fn connect(
    host: &str,
    port: u16,
    ack_timeout: Duration,
) -> Result<(FramedLink<OwnedWriteHalf>, BufReader<OwnedReadHalf>), LinkError> {
    let stream = TcpStream::connect((host, port)).await?;
    let (reader, writer) = stream.into_split();
    let link = FramedLink::new(writer, ack_timeout);
    link.write_frame(&encode_frame(
        "CONNECT",
        &[("accept-version", "1.2".to_string())],
        &[],
    ))
    .await?;
    Ok((link, BufReader::new(reader)))
}
