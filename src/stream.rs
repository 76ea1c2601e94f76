//! Adapts a WebSocket connection to the ordered byte stream the SSH session
//! layer consumes.
//!
//! The WebSocket carries discrete frames; the session layer wants a plain
//! duplex byte stream. The adapter forwards binary frames, in receipt order
//! and without re-segmentation, through its `AsyncRead` half, and turns each
//! `AsyncWrite` into one outbound binary frame. Every other frame kind is
//! protocol noise and is dropped.
//!
//! Lifecycle notifications (end-of-stream, closure, terminal errors) are
//! delivered as typed events on an unbounded channel, in a documented order:
//! a local `close` fires `Closed` first, then `Error`.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use futures_util::{Sink, SinkExt, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Close code sent when an abnormal close reason carries no code of its own.
pub const DEFAULT_ABNORMAL_CLOSE_CODE: u16 = 1011;

/// Reason attached to an abnormal close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub message: String,
}

/// Lifecycle notifications emitted by a [`StreamAdapter`].
///
/// `Closed` is always observed before the `Error` that accompanies a local
/// close. Incoming clean shutdown yields `End`; incoming abnormal shutdown
/// yields `Error` carrying the observed close code.
#[derive(Debug)]
pub enum StreamEvent {
    /// Clean end-of-stream observed from the peer
    End,
    /// Local close completed, with the reason it was given
    Closed(Option<CloseReason>),
    /// Terminal stream error
    Error(Error),
}

/// Wraps exactly one WebSocket connection as an ordered byte stream.
pub struct StreamAdapter<S> {
    ws: WebSocketStream<S>,
    disposed: bool,
    eof: bool,
    /// Remainder of a frame not yet drained by the reader.
    read_buf: BytesMut,
    events: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl<S> StreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            disposed: false,
            eof: false,
            read_buf: BytesMut::new(),
            events: None,
        }
    }

    /// Subscribe to lifecycle events. Call before handing the adapter to the
    /// session layer; only one subscriber is supported.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Send `bytes` as a single outbound binary frame.
    ///
    /// Resolves once the frame is enqueued on the transport; delivery
    /// acknowledgment is not part of the contract.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.disposed {
            return Err(Error::ObjectDisposed);
        }
        if bytes.is_empty() {
            return Err(Error::invalid("cannot write an empty message"));
        }
        self.ws.send(Message::Binary(bytes.to_vec())).await?;
        Ok(())
    }

    /// Close the stream, gracefully when `reason` is absent, abnormally (with
    /// the reason's code, or [`DEFAULT_ABNORMAL_CLOSE_CODE`]) otherwise.
    ///
    /// Fires `Closed` and then `Error` so listeners observe closure before
    /// or alongside the terminal error.
    pub async fn close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        if self.disposed {
            return Err(Error::ObjectDisposed);
        }
        self.disposed = true;

        let frame = reason.as_ref().map(|r| CloseFrame {
            code: CloseCode::from(r.code.unwrap_or(DEFAULT_ABNORMAL_CLOSE_CODE)),
            reason: r.message.clone().into(),
        });
        if let Err(e) = self.ws.close(frame).await {
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {}
                e => warn!(error = %e, "transport close failed"),
            }
        }

        self.emit(StreamEvent::Closed(reason.clone()));
        let error = match reason {
            Some(r) => Error::AbnormalClose {
                code: r.code.unwrap_or(DEFAULT_ABNORMAL_CLOSE_CODE),
                reason: r.message,
            },
            None => Error::StreamClosed,
        };
        self.emit(StreamEvent::Error(error));
        Ok(())
    }

    /// Close the transport with no reason and mark the adapter disposed.
    /// Idempotent; never fails.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Err(e) = self.ws.close(None).await {
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {}
                e => debug!(error = %e, "transport close during dispose failed"),
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn io_err(e: WsError) -> io::Error {
    io::Error::other(Error::Transport(e))
}

impl<S> AsyncRead for StreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    if this.disposed {
                        trace!(len = data.len(), "dropping frame received after dispose");
                        continue;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    this.read_buf.extend_from_slice(&data);
                }
                Some(Ok(Message::Close(frame))) => {
                    this.eof = true;
                    let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(0);
                    if code == 0 {
                        this.emit(StreamEvent::End);
                        return Poll::Ready(Ok(()));
                    }
                    let reason = frame
                        .map(|f| f.reason.into_owned())
                        .unwrap_or_default();
                    this.emit(StreamEvent::Error(Error::AbnormalClose {
                        code,
                        reason: reason.clone(),
                    }));
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        Error::AbnormalClose { code, reason },
                    )));
                }
                // Text, ping, and pong frames never carry protocol data.
                Some(Ok(other)) => {
                    trace!(kind = ?message_kind(&other), "ignoring non-binary frame");
                }
                Some(Err(e)) => {
                    this.eof = true;
                    this.emit(StreamEvent::Error(Error::Transport(clone_ws_error(&e))));
                    return Poll::Ready(Err(io_err(e)));
                }
                None => {
                    this.eof = true;
                    this.emit(StreamEvent::End);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S> AsyncWrite for StreamAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.disposed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                Error::ObjectDisposed,
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(Pin::new(&mut this.ws).poll_ready(cx)).map_err(io_err)?;
        Pin::new(&mut this.ws)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.disposed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.ws).poll_flush(cx).map_err(io_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.disposed {
            return Poll::Ready(Ok(()));
        }
        match ready!(Pin::new(&mut this.ws).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(e) => return Poll::Ready(Err(io_err(e))),
        }
        this.disposed = true;
        this.emit(StreamEvent::Closed(None));
        this.emit(StreamEvent::Error(Error::StreamClosed));
        Poll::Ready(Ok(()))
    }
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

/// Transport errors surface unmodified through the reader; the event copy
/// can only preserve identity for variants that carry no stream state.
fn clone_ws_error(e: &WsError) -> WsError {
    match e {
        WsError::ConnectionClosed => WsError::ConnectionClosed,
        WsError::AlreadyClosed => WsError::AlreadyClosed,
        other => WsError::Io(io::Error::other(other.to_string())),
    }
}
