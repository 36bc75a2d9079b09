//! Generic service protocol framework.
//!
//! A service is one protocol sub-channel (beat sync, state notification,
//! file transfer) bound to exactly one socket session. This module owns the
//! parts every service shares: inbound length framing, strictly sequential
//! decode-then-dispatch, the atomic write primitive, and the spawned-session
//! handle. Concrete services own only their message family via
//! [`ServiceHandler`].

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::context::{ReadContext, WriteContext};
use crate::{Error, Result};

/// One decoded frame from a service's primary message family.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMessage<T> {
    /// Numeric message-type tag read off the wire.
    pub id: u32,
    /// Decoded payload.
    pub message: T,
}

/// Decode/handle contract implemented per concrete service.
///
/// The framework guarantees `handle` runs on the session task, one frame at
/// a time, in socket-arrival order; a second frame is never decoded before
/// the handler for the prior frame returns.
pub trait ServiceHandler: Send + 'static {
    /// Service name used in logs, errors, and the device service map.
    const NAME: &'static str;

    /// Decoded payload type.
    type Message: Send;

    /// Whether a frame with this message id belongs to the primary family.
    /// Frames that do not are routed to [`ServiceHandler::parse_service_data`].
    fn is_primary(&self, id: u32) -> bool {
        let _ = id;
        true
    }

    /// Decode one frame. The cursor must be fully consumed by the time the
    /// frame is dispatched; leftover bytes are a structural decode fault.
    fn parse(&mut self, ctx: &mut ReadContext) -> Result<ServiceMessage<Self::Message>>;

    /// Consume one decoded frame.
    fn handle(&mut self, message: ServiceMessage<Self::Message>);

    /// Out-of-band/administrative frames. Default: log and discard.
    fn parse_service_data(&mut self, id: u32, ctx: &mut ReadContext) {
        trace!(
            service = Self::NAME,
            id,
            len = ctx.size_left(),
            "RX: administrative frame discarded"
        );
    }
}

/// Sends the accumulated write-cursor bytes atomically on the socket.
///
/// The concrete service's request builder owns the envelope content; the
/// framework only guarantees the bytes go out in one piece.
pub async fn write<S>(ctx: WriteContext, socket: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = ctx.into_bytes();
    trace!(len = bytes.len(), "TX: frame");
    socket.write_all(&bytes).await?;
    socket.flush().await?;
    Ok(())
}

/// Runs the read loop for one service session.
///
/// Each frame is a u32 big-endian length prefix followed by that many
/// payload bytes. Returns `Ok(())` when the peer closes between frames.
/// Malformed input is fatal for the session: the error is returned, the
/// socket drops, and reconnection is the orchestrator's decision.
pub async fn run<H, S>(mut handler: H, mut socket: S) -> Result<()>
where
    H: ServiceHandler,
    S: AsyncRead + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        match socket.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(service = H::NAME, "RX: connection closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        socket
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
                _ => Error::Io(e),
            })?;
        trace!(service = H::NAME, len, "RX: frame");

        let mut ctx = ReadContext::new(Bytes::from(payload));
        let id = ctx.peek_u32().map_err(|_| Error::Decode {
            service: H::NAME,
            message_id: None,
            detail: format!("frame of {len} bytes is shorter than a message id"),
        })?;

        if handler.is_primary(id) {
            let message = handler.parse(&mut ctx).map_err(|e| match e {
                Error::BufferExhausted { needed, remaining } => Error::Decode {
                    service: H::NAME,
                    message_id: Some(id),
                    detail: format!(
                        "buffer exhausted: needed {needed} more bytes, {remaining} remaining"
                    ),
                },
                other => other,
            })?;
            if !ctx.is_eof() {
                return Err(Error::Decode {
                    service: H::NAME,
                    message_id: Some(id),
                    detail: format!("{} bytes left after parse", ctx.size_left()),
                });
            }
            handler.handle(message);
        } else {
            handler.parse_service_data(id, &mut ctx);
        }
    }
}

/// Spawns the session read loop and returns a handle to it.
///
/// Session-fatal errors are logged here; the task ends either way.
pub(crate) fn spawn<H, S>(handler: H, socket: S) -> ServiceHandle
where
    H: ServiceHandler,
    S: AsyncRead + Unpin + Send + 'static,
{
    let task = tokio::spawn(async move {
        match run(handler, socket).await {
            Ok(()) => debug!(service = H::NAME, "Service session ended"),
            Err(e) => error!(service = H::NAME, error = %e, "Service session fault"),
        }
    });
    ServiceHandle::new(H::NAME, task)
}

struct Session(JoinHandle<()>);

impl Drop for Session {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handle to a live service session.
///
/// Cheap to clone; the session is aborted when the last clone is dropped or
/// [`ServiceHandle::disconnect`] is called, which drops the socket half the
/// read loop owns.
#[derive(Clone)]
pub struct ServiceHandle {
    name: &'static str,
    session: Arc<Session>,
}

impl ServiceHandle {
    fn new(name: &'static str, task: JoinHandle<()>) -> Self {
        Self {
            name,
            session: Arc::new(Session(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the session and releases its socket.
    pub fn disconnect(&self) {
        self.session.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.session.0.is_finished()
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("finished", &self.session.0.is_finished())
            .finish()
    }
}
