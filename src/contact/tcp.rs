//! Newline-delimited TCP transport for contact channels.
//!
//! Each request line is `<channel> <payload>` and gets exactly one response
//! line: the channel's encoded reply, or `ERR <message>`. A line longer
//! than the frame limit gets one `ERR` and the connection is closed.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::contact::ContactService;
use crate::error::Result;

/// Default limit for one request line. Uploads travel inline, so this is
/// generous.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How long unread input is drained after an oversized frame, so the close
/// does not turn into a reset that swallows the `ERR` line.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct TcpTransport {
    listener: TcpListener,
    service: Arc<ContactService>,
    max_frame: usize,
}

impl TcpTransport {
    pub async fn bind(addr: &str, service: Arc<ContactService>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Contact listener bound to {}", listener.local_addr()?);
        Ok(Self {
            listener,
            service,
            max_frame: MAX_FRAME_BYTES,
        })
    }

    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. Each connection is served
    /// on its own task.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Contact connection from {}", peer);
                        let service = self.service.clone();
                        let cancel = cancel.clone();
                        let max_frame = self.max_frame;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service, max_frame, cancel).await {
                                debug!("Contact connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Contact accept error: {}", e),
                },
            }
        }
        info!("Contact listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<ContactService>,
    max_frame: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(max_frame));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Contact frame over {} bytes, closing connection", max_frame);
                let reply = format!("ERR frame exceeds {} bytes\n", max_frame);
                write.write_all(reply.as_bytes()).await?;
                write.shutdown().await?;
                let mut rest = lines.into_inner();
                let _ = tokio::time::timeout(
                    CLOSE_GRACE,
                    tokio::io::copy(&mut rest, &mut tokio::io::sink()),
                )
                .await;
                return Ok(());
            }
            Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!("Contact frame: {} bytes", line.len());

        let reply = match line.trim().split_once(' ') {
            Some((channel, payload)) => match service.handle_beacon(channel, payload).await {
                Ok(reply) => reply,
                Err(e) => format!("ERR {}", e),
            },
            None => "ERR expected '<channel> <payload>'".to_string(),
        };
        write.write_all(reply.as_bytes()).await?;
        write.write_all(b"\n").await?;
    }
    Ok(())
}
