//! File request service.
//!
//! Exposes the two operations the orchestrator needs from a remote device:
//! downloading one file by path and listing the database sources available
//! for download. Requests are correlated to responses by the strict frame
//! sequentiality of the service loop: replies arrive in request order, so a
//! FIFO queue of pending reply senders suffices.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::context::{ReadContext, WriteContext};
use crate::service::{self, ServiceHandle, ServiceHandler, ServiceMessage};
use crate::{Error, Result};

/// Fixed subscription request: command id 2, zero-length payload.
const SUBSCRIBE_REQUEST: [u8; 8] = [0, 0, 0, 2, 0, 0, 0, 0];

/// Message id for a database source listing.
const MSG_SOURCES: u32 = 1;
/// Message id for a file payload.
const MSG_FILE: u32 = 2;

/// Decoded file-transfer responses.
#[derive(Debug, Clone, PartialEq)]
pub enum FileTransferMessage {
    Sources(Vec<String>),
    File(Bytes),
}

enum Pending {
    Sources(oneshot::Sender<Vec<String>>),
    File(oneshot::Sender<Bytes>),
}

type PendingQueue = Arc<Mutex<VecDeque<Pending>>>;

/// Handler for the file-transfer message family; fulfills pending replies
/// in FIFO order.
pub struct FileTransferHandler {
    pending: PendingQueue,
}

impl Drop for FileTransferHandler {
    fn drop(&mut self) {
        // Session is over; dropping the senders fails every waiting caller
        // with ServiceClosed instead of hanging them.
        self.pending.lock().unwrap().clear();
    }
}

impl ServiceHandler for FileTransferHandler {
    const NAME: &'static str = "FileTransfer";
    type Message = FileTransferMessage;

    fn is_primary(&self, id: u32) -> bool {
        matches!(id, MSG_SOURCES | MSG_FILE)
    }

    fn parse(&mut self, ctx: &mut ReadContext) -> Result<ServiceMessage<FileTransferMessage>> {
        let id = ctx.read_u32()?;
        let message = match id {
            MSG_SOURCES => {
                let count = ctx.read_u32()?;
                let mut sources = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let len = ctx.read_u32()? as usize;
                    let name =
                        String::from_utf8(ctx.read_bytes(len)?.to_vec()).map_err(|_| {
                            Error::Decode {
                                service: Self::NAME,
                                message_id: Some(id),
                                detail: "source name is not UTF-8".to_string(),
                            }
                        })?;
                    sources.push(name);
                }
                FileTransferMessage::Sources(sources)
            }
            MSG_FILE => {
                let size = ctx.read_u32()? as usize;
                FileTransferMessage::File(ctx.read_bytes(size)?)
            }
            other => {
                return Err(Error::Decode {
                    service: Self::NAME,
                    message_id: Some(other),
                    detail: "unknown message id".to_string(),
                })
            }
        };
        Ok(ServiceMessage { id, message })
    }

    fn handle(&mut self, message: ServiceMessage<FileTransferMessage>) {
        let pending = self.pending.lock().unwrap().pop_front();
        match (pending, message.message) {
            (Some(Pending::Sources(reply)), FileTransferMessage::Sources(sources)) => {
                let _ = reply.send(sources);
            }
            (Some(Pending::File(reply)), FileTransferMessage::File(bytes)) => {
                let _ = reply.send(bytes);
            }
            (Some(_), _) => {
                // Dropping the sender surfaces ServiceClosed to the caller.
                warn!(id = message.id, "RX: response kind does not match pending request");
            }
            (None, _) => {
                warn!(id = message.id, "RX: unsolicited file-transfer response");
            }
        }
    }
}

/// Handle for issuing file requests on a connected session.
pub struct FileTransfer {
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending: PendingQueue,
    session: ServiceHandle,
}

impl FileTransfer {
    /// Sends the subscription request and spawns the session read loop on
    /// the supplied socket.
    pub async fn connect<S>(socket: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(socket);

        let mut ctx = WriteContext::with_capacity(SUBSCRIBE_REQUEST.len());
        ctx.write_bytes(&SUBSCRIBE_REQUEST);
        service::write(ctx, &mut write_half).await?;
        debug!("TX: file-transfer subscribe");

        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let handler = FileTransferHandler {
            pending: Arc::clone(&pending),
        };
        let session = service::spawn(handler, read_half);

        Ok(Self {
            writer: AsyncMutex::new(Box::new(write_half)),
            pending,
            session,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.session.is_finished() {
            return Err(Error::ServiceClosed(FileTransferHandler::NAME));
        }
        Ok(())
    }

    /// Lists the remote database sources available for download.
    pub async fn sources(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        // Enqueue before writing so a fast response always finds its slot.
        self.pending.lock().unwrap().push_back(Pending::Sources(tx));

        let mut ctx = WriteContext::new();
        ctx.write_u32(MSG_SOURCES);
        self.write(ctx).await?;
        debug!("TX: sources request");

        rx.await
            .map_err(|_| Error::ServiceClosed(FileTransferHandler::NAME))
    }

    /// Requests one file by path from the remote device.
    pub async fn download(&self, path: &str) -> Result<Bytes> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push_back(Pending::File(tx));

        let mut ctx = WriteContext::new();
        ctx.write_u32(MSG_FILE);
        ctx.write_u32(path.len() as u32);
        ctx.write_bytes(path.as_bytes());
        self.write(ctx).await?;
        debug!(path, "TX: file request");

        rx.await
            .map_err(|_| Error::ServiceClosed(FileTransferHandler::NAME))
    }

    async fn write(&self, ctx: WriteContext) -> Result<()> {
        let mut writer = self.writer.lock().await;
        service::write(ctx, &mut *writer).await
    }

    /// Handle for the underlying session, for registry bookkeeping.
    pub fn session_handle(&self) -> ServiceHandle {
        self.session.clone()
    }

    /// Stops the session and releases its socket.
    pub fn disconnect(&self) {
        self.session.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Reads and discards the subscribe request, then answers each request
    /// frame with a canned response built by `respond`.
    async fn serve(
        mut socket: tokio::io::DuplexStream,
        mut respond: impl FnMut(u32, ReadContext) -> Vec<u8> + Send,
        requests: usize,
    ) {
        let mut subscribe = [0u8; 8];
        socket.read_exact(&mut subscribe).await.unwrap();
        assert_eq!(subscribe, SUBSCRIBE_REQUEST);

        for _ in 0..requests {
            // Requests are not length-prefixed; the request builder owns the
            // envelope. Read the id, then whatever the id implies.
            let mut id_buf = [0u8; 4];
            socket.read_exact(&mut id_buf).await.unwrap();
            let id = u32::from_be_bytes(id_buf);

            let rest = if id == MSG_FILE {
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut path = vec![0u8; len];
                socket.read_exact(&mut path).await.unwrap();
                path
            } else {
                Vec::new()
            };

            let payload = respond(id, ReadContext::new(Bytes::from(rest)));
            let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(&payload);
            socket.write_all(&frame).await.unwrap();
        }
    }

    fn sources_response(names: &[&str]) -> Vec<u8> {
        let mut ctx = WriteContext::new();
        ctx.write_u32(MSG_SOURCES);
        ctx.write_u32(names.len() as u32);
        for name in names {
            ctx.write_u32(name.len() as u32);
            ctx.write_bytes(name.as_bytes());
        }
        ctx.into_bytes().to_vec()
    }

    fn file_response(content: &[u8]) -> Vec<u8> {
        let mut ctx = WriteContext::new();
        ctx.write_u32(MSG_FILE);
        ctx.write_u32(content.len() as u32);
        ctx.write_bytes(content);
        ctx.into_bytes().to_vec()
    }

    #[tokio::test]
    async fn sources_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(serve(
            server,
            |_, _| sources_response(&["Engine Library", "USB 1"]),
            1,
        ));

        let transfer = FileTransfer::connect(client).await.unwrap();
        let sources = transfer.sources().await.unwrap();
        assert_eq!(sources, vec!["Engine Library", "USB 1"]);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn download_returns_the_file_bytes() {
        let (client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(serve(
            server,
            |id, mut request| {
                assert_eq!(id, MSG_FILE);
                let path = request.read_bytes(request.size_left()).unwrap();
                assert_eq!(&path[..], b"/db/m.db");
                file_response(b"track data")
            },
            1,
        ));

        let transfer = FileTransfer::connect(client).await.unwrap();
        let bytes = transfer.download("/db/m.db").await.unwrap();
        assert_eq!(&bytes[..], b"track data");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn session_loss_fails_pending_requests() {
        let (client, mut server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            let mut subscribe = [0u8; 8];
            server.read_exact(&mut subscribe).await.unwrap();
            // Swallow the request, then go away without answering.
            let mut id_buf = [0u8; 4];
            server.read_exact(&mut id_buf).await.unwrap();
        });

        let transfer = FileTransfer::connect(client).await.unwrap();
        match transfer.sources().await {
            Err(Error::ServiceClosed(name)) => assert_eq!(name, "FileTransfer"),
            other => panic!("expected ServiceClosed, got {other:?}"),
        }
        peer.await.unwrap();
    }
}
