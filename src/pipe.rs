//! The bidirectional pump for live sessions.
//!
//! Once a connection is routed and replayed, the stream is opaque: two
//! copy loops, one task per direction, run until EOF, an error, or the
//! idle timeout. Each loop half-closes its write side on the way out so
//! the opposite loop sees EOF instead of hanging.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::timeout;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

enum Direction {
    Upstream,
    Downstream,
}

/// Pumps bytes in both directions until the session ends. Returns the
/// byte counts (or errors) for the client-to-server and server-to-client
/// directions.
///
/// The loops run inside a `JoinSet`: cancelling this future aborts both
/// of them, which drops the socket halves and ends the session.
pub async fn run<CR, CW, SR, SW>(
    client_reader: CR,
    client_writer: CW,
    server_reader: SR,
    server_writer: SW,
    idle_timeout: Option<Duration>,
) -> (io::Result<u64>, io::Result<u64>)
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send + 'static,
{
    let mut loops = JoinSet::new();
    loops.spawn(async move {
        (
            Direction::Upstream,
            copy_half(client_reader, server_writer, idle_timeout).await,
        )
    });
    loops.spawn(async move {
        (
            Direction::Downstream,
            copy_half(server_reader, client_writer, idle_timeout).await,
        )
    });

    let failed = || io::Error::new(io::ErrorKind::Other, "pump task failed");
    let (mut upstream, mut downstream) = (Err(failed()), Err(failed()));
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok((Direction::Upstream, result)) => upstream = result,
            Ok((Direction::Downstream, result)) => downstream = result,
            Err(_) => {}
        }
    }
    (upstream, downstream)
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, idle_timeout: Option<Duration>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let read = match idle_timeout {
            Some(limit) => match timeout(limit, reader.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    break Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "session idle timeout",
                    ))
                }
            },
            None => reader.read(&mut buffer).await,
        };

        match read {
            Ok(0) => break Ok(total),
            Ok(count) => {
                if let Err(err) = writer.write_all(&buffer[..count]).await {
                    break Err(err);
                }
                total += count as u64;
            }
            Err(err) => break Err(err),
        }
    };

    let _ = writer.shutdown().await;
    result
}
