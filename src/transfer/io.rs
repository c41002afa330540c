//! Socket side of bytestreams: drives the SOCKS5 machines over tokio and
//! pumps file data with backpressure.

use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::socks5::{ConnectInput, ConnectOutput, Socks5Acceptor, Socks5Connector};
use super::Candidate;
use crate::error::{TransferError, TransferResult};

/// Largest chunk moved per read. The next read only starts once the
/// previous chunk has been written out completely.
pub const CHUNK_SIZE: usize = 8192;

/// How long one connected peer may take to finish the SOCKS5 greeting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected bytestream.
#[derive(Debug)]
pub struct Established {
    /// Index of the candidate that worked
    pub index: usize,
    pub stream: TcpStream,
    /// Bytes already read past the handshake
    pub leftover: Vec<u8>,
}

enum Wake {
    Connected(TcpStream),
    ConnectFailed(std::io::Error),
    Timeout,
    Read(usize),
    ReadFailed(std::io::Error),
}

/// Try `candidates` in order until one completes the SOCKS5 handshake for
/// `digest`.
pub async fn connect_candidates(
    candidates: &[Candidate],
    digest: &str,
    connect_timeout: Duration,
) -> TransferResult<Established> {
    let mut machine = Socks5Connector::new(candidates.to_vec(), digest, connect_timeout);
    let mut socket: Option<TcpStream> = None;
    let mut connecting: Option<(String, u16)> = None;
    let mut deadline: Option<Instant> = None;
    let mut buf = [0u8; 512];
    let mut outputs = machine.step(ConnectInput::Start);

    loop {
        let mut follow_up: Option<ConnectInput<'static>> = None;
        for output in outputs.drain(..) {
            match output {
                ConnectOutput::OpenSocket { index, host, port } => {
                    debug!(index, host = %host, port, "connecting to streamhost");
                    connecting = Some((host, port));
                }
                ConnectOutput::ArmTimer { duration, .. } => deadline = Some(Instant::now() + duration),
                ConnectOutput::DisarmTimer { .. } => deadline = None,
                ConnectOutput::Send { bytes, .. } => {
                    let result = match socket.as_mut() {
                        Some(s) => s.write_all(&bytes).await,
                        None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
                    };
                    follow_up = Some(match result {
                        Ok(()) => ConnectInput::Flushed,
                        Err(e) => ConnectInput::Error(e.to_string()),
                    });
                }
                ConnectOutput::CloseSocket { .. } => {
                    socket = None;
                    connecting = None;
                }
                ConnectOutput::CandidateFailed { index, reason } => {
                    if let Some(c) = candidates.get(index) {
                        warn!(
                            host = %c.host,
                            port = c.port,
                            error = %reason,
                            "connection to streamhost failed"
                        );
                    }
                }
                ConnectOutput::Established { index, leftover } => {
                    let stream = socket.take().ok_or_else(|| {
                        TransferError::Handshake("established without a socket".to_string())
                    })?;
                    info!(index, "bytestream established");
                    return Ok(Established {
                        index,
                        stream,
                        leftover,
                    });
                }
                ConnectOutput::Exhausted { reason } => return Err(TransferError::Exhausted(reason)),
            }
        }
        if let Some(input) = follow_up {
            outputs = machine.step(input);
            continue;
        }

        // Connect and its timeout race in one select, so a losing connect
        // future is dropped together with the timer.
        let wake = if let Some((host, port)) = connecting.clone() {
            tokio::select! {
                res = TcpStream::connect((host.as_str(), port)) => match res {
                    Ok(s) => Wake::Connected(s),
                    Err(e) => Wake::ConnectFailed(e),
                },
                _ = sleep_until_opt(deadline) => Wake::Timeout,
            }
        } else if let Some(s) = socket.as_mut() {
            tokio::select! {
                res = s.read(&mut buf) => match res {
                    Ok(n) => Wake::Read(n),
                    Err(e) => Wake::ReadFailed(e),
                },
                _ = sleep_until_opt(deadline) => Wake::Timeout,
            }
        } else {
            return Err(TransferError::Handshake("connector stalled".to_string()));
        };

        outputs = match wake {
            Wake::Connected(s) => {
                connecting = None;
                socket = Some(s);
                machine.step(ConnectInput::Connected)
            }
            Wake::ConnectFailed(e) => {
                connecting = None;
                machine.step(ConnectInput::Error(e.to_string()))
            }
            Wake::Timeout => {
                deadline = None;
                connecting = None;
                machine.step(ConnectInput::Timeout)
            }
            Wake::Read(0) => machine.step(ConnectInput::Hangup),
            Wake::Read(n) => machine.step(ConnectInput::Data(&buf[..n])),
            Wake::ReadFailed(e) => machine.step(ConnectInput::Error(e.to_string())),
        };
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Accept connections on our local streamhost until one completes the
/// handshake for `digest`, giving up after `listen_timeout`.
///
/// Handshakes run side by side, each bounded by its own deadline, so a
/// peer that connects and stays silent cannot hold up the real one. Peers
/// that fail the handshake are dropped and the listener keeps waiting.
pub async fn accept_streamhost(
    listener: TcpListener,
    digest: &str,
    listen_timeout: Duration,
) -> TransferResult<(TcpStream, Vec<u8>)> {
    let secs = listen_timeout.as_secs();
    timeout(
        listen_timeout,
        accept_loop(&listener, digest, HANDSHAKE_TIMEOUT),
    )
    .await
    .map_err(|_| TransferError::Timeout {
        phase: "waiting for a bytestream connection",
        secs,
    })?
}

async fn accept_loop(
    listener: &TcpListener,
    digest: &str,
    handshake_timeout: Duration,
) -> TransferResult<(TcpStream, Vec<u8>)> {
    let mut handshakes = FuturesUnordered::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(peer = %peer, "bytestream peer connected");
                handshakes.push(async move {
                    (peer, timeout(handshake_timeout, serve_handshake(stream, digest)).await)
                });
            }
            Some((peer, outcome)) = handshakes.next(), if !handshakes.is_empty() => {
                match outcome {
                    Ok(Ok(done)) => return Ok(done),
                    Ok(Err(e)) => warn!(peer = %peer, error = %e, "rejected bytestream peer"),
                    Err(_) => warn!(peer = %peer, "bytestream peer never finished the handshake"),
                }
            }
        }
    }
}

async fn serve_handshake(
    mut stream: TcpStream,
    digest: &str,
) -> TransferResult<(TcpStream, Vec<u8>)> {
    let mut acceptor = Socks5Acceptor::new(digest);
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransferError::Hangup("SOCKS5 handshake"));
        }
        let progress = acceptor
            .on_data(&buf[..n])
            .map_err(TransferError::Handshake)?;
        if !progress.reply.is_empty() {
            stream.write_all(&progress.reply).await?;
        }
        if let Some(leftover) = progress.established {
            return Ok((stream, leftover));
        }
    }
}

/// Copy exactly `total` bytes from `reader` to `writer`, starting with
/// `leftover`. Reports the running count after every chunk.
///
/// The reader is never polled while a chunk is still being written, so a
/// slow sink throttles the source.
pub async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    leftover: Vec<u8>,
    mut progress: F,
) -> TransferResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut transferred = 0u64;
    if !leftover.is_empty() {
        let take = leftover.len().min(total as usize);
        writer.write_all(&leftover[..take]).await?;
        transferred += take as u64;
        progress(transferred);
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    while transferred < total {
        let want = (total - transferred).min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::Truncated { transferred, total });
        }
        writer.write_all(&buf[..n]).await?;
        transferred += n as u64;
        progress(transferred);
    }
    writer.flush().await?;
    Ok(transferred)
}
