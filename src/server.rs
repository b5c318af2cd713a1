//! Line-oriented TCP admission server.
//!
//! Every line a client sends is one work item, keyed by the client's IP
//! address. Admitted items are forwarded (echoed back as `OK <line>`);
//! rejected items are answered with `ERR rate limit exceeded` and dropped.
//! A line longer than [`MAX_LINE_LEN`] closes the connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::ratelimit::Limiter;

/// Reply sent for a work item that was rejected.
pub const RATE_LIMITED_REPLY: &str = "ERR rate limit exceeded";
/// Reply sent when the limiter could not reach its store.
pub const UNAVAILABLE_REPLY: &str = "ERR service unavailable";
/// Reply sent before closing a connection whose line is too long.
pub const LINE_TOO_LONG_REPLY: &str = "ERR line too long";

/// Longest accepted line in bytes, not counting the line terminator.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// What happens to one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the item downstream
    Forward,
    /// Drop the item, the key is over its limit
    Reject,
    /// Drop the item, the limiter failed
    Unavailable,
}

/// Ask the limiter about one work item.
///
/// `allow` may block on its store, so it runs on the blocking pool.
pub async fn admit(limiter: &Arc<dyn Limiter>, key: &str) -> Verdict {
    let limiter = Arc::clone(limiter);
    let owned_key = key.to_string();

    match tokio::task::spawn_blocking(move || limiter.allow(&owned_key)).await {
        Ok(Ok(true)) => Verdict::Forward,
        Ok(Ok(false)) => Verdict::Reject,
        Ok(Err(e)) => {
            error!(key = %key, error = %e, "Limiter failed");
            Verdict::Unavailable
        }
        Err(e) => {
            error!(key = %key, error = %e, "Limiter task panicked");
            Verdict::Unavailable
        }
    }
}

/// TCP server that gates every received line through a limiter.
pub struct AdmissionServer {
    listener: TcpListener,
    limiter: Arc<dyn Limiter>,
}

impl AdmissionServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, limiter: Arc<dyn Limiter>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, limiter })
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `signal` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %self.local_addr()?, "Starting admission server");
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Admission server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let limiter = Arc::clone(&self.limiter);
                            let span = info_span!("connection", id = %Uuid::new_v4(), peer = %peer);
                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, peer, limiter).await {
                                        warn!(error = %e, "Connection closed with error");
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

/// One read from a client connection.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Item(String),
    TooLong,
    Closed,
}

/// Read the next line, buffering at most `MAX_LINE_LEN` bytes plus the newline.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_LINE_LEN as u64 + 1;
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Line::Closed);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LEN {
        return Ok(Line::TooLong);
    }

    Ok(Line::Item(String::from_utf8_lossy(buf).into_owned()))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    limiter: Arc<dyn Limiter>,
) -> Result<()> {
    debug!("Accepted connection");

    let key = peer.ip().to_string();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let line = match read_line(&mut reader, &mut buf).await? {
            Line::Item(line) => line,
            Line::TooLong => {
                warn!(limit = MAX_LINE_LEN, "Line too long, closing connection");
                writer.write_all(LINE_TOO_LONG_REPLY.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                return Ok(());
            }
            Line::Closed => break,
        };

        let reply = match admit(&limiter, &key).await {
            Verdict::Forward => format!("OK {}", line),
            Verdict::Reject => RATE_LIMITED_REPLY.to_string(),
            Verdict::Unavailable => UNAVAILABLE_REPLY.to_string(),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    debug!("Connection closed by peer");
    Ok(())
}
