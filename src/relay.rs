//! Bidirectional byte relay with half-close propagation

use parking_lot::Mutex;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Copy bytes between `client` and `backend` until both directions reach
/// EOF. Both directions run concurrently; when one side finishes, the write
/// half of the other side is shut down. Ends early with an error when no
/// byte moves in either direction for `idle`, or when `shutdown` fires (or
/// its sender is dropped).
pub async fn relay<C, B>(
    client: C,
    backend: B,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return Err(aborted());
    }

    let (client_rd, client_wr) = tokio::io::split(client);
    let (backend_rd, backend_wr) = tokio::io::split(backend);
    let last_activity = Mutex::new(Instant::now());

    let copies = async {
        tokio::try_join!(
            copy_half(client_rd, backend_wr, &last_activity, "client"),
            copy_half(backend_rd, client_wr, &last_activity, "backend"),
        )
    };

    let idle_watch = async {
        loop {
            let deadline = *last_activity.lock() + idle;
            tokio::time::sleep_until(deadline).await;
            if last_activity.lock().elapsed() >= idle {
                return;
            }
        }
    };

    tokio::select! {
        biased;

        _ = shutdown.wait_for(|stopped| *stopped) => Err(aborted()),
        _ = idle_watch => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        result = copies => {
            let (client_to_backend, backend_to_client) = result?;
            Ok(RelayStats {
                client_to_backend,
                backend_to_client,
            })
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "endpoint closed")
}

/// One direction of the relay. Shuts down `writer` once `reader` hits EOF.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    last_activity: &Mutex<Instant>,
    side: &str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        *last_activity.lock() = Instant::now();
        if n == 0 {
            trace!(side, "reached EOF");
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        *last_activity.lock() = Instant::now();
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_copies_both_ways_and_propagates_close() {
        let (client_outer, client_inner) = duplex(1024);
        let (backend_inner, backend_outer) = duplex(1024);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay(client_inner, backend_inner, Duration::from_secs(5), rx));

        let (mut client_rd, mut client_wr) = tokio::io::split(client_outer);
        let (mut backend_rd, mut backend_wr) = tokio::io::split(backend_outer);

        client_wr.write_all(b"ping").await.unwrap();
        client_wr.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend_rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // the half-closed client can still read the reply
        backend_wr.write_all(b"pong").await.unwrap();
        backend_wr.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_rd.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 4);
        assert_eq!(stats.backend_to_client, 4);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client_outer, client_inner) = duplex(64);
        let (backend_inner, _backend_outer) = duplex(64);
        let (_tx, rx) = watch::channel(false);

        let err = relay(client_inner, backend_inner, Duration::from_millis(50), rx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_relay_stops_on_shutdown() {
        let (_client_outer, client_inner) = duplex(64);
        let (backend_inner, _backend_outer) = duplex(64);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay(client_inner, backend_inner, Duration::from_secs(30), rx));
        tx.send(true).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_relay_full_duplex_when_backend_writes_first() {
        const PAYLOAD: usize = 32 * 1024 * 1024;

        let (client_outer, client_inner) = duplex(64 * 1024);
        let (backend_inner, backend_outer) = duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay(client_inner, backend_inner, Duration::from_secs(5), rx));

        // backend sends its whole reply before reading anything
        let backend = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(backend_outer);
            wr.write_all(&vec![7u8; PAYLOAD]).await.unwrap();
            wr.shutdown().await.unwrap();
            let mut received = Vec::new();
            rd.read_to_end(&mut received).await.unwrap();
            received.len()
        });

        let (mut client_rd, mut client_wr) = tokio::io::split(client_outer);
        let writer = tokio::spawn(async move {
            client_wr.write_all(&vec![9u8; PAYLOAD]).await.unwrap();
            client_wr.shutdown().await.unwrap();
        });
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            client_rd.read_to_end(&mut received).await.unwrap();
            received.len()
        });

        let (stats, backend_got, client_got) = tokio::time::timeout(Duration::from_secs(20), async {
            writer.await.unwrap();
            (
                task.await.unwrap().unwrap(),
                backend.await.unwrap(),
                reader.await.unwrap(),
            )
        })
        .await
        .expect("relay stalled under full-duplex load");

        assert_eq!(backend_got, PAYLOAD);
        assert_eq!(client_got, PAYLOAD);
        assert_eq!(stats.client_to_backend, PAYLOAD as u64);
        assert_eq!(stats.backend_to_client, PAYLOAD as u64);
    }

    #[tokio::test]
    async fn test_relay_one_way_stream_is_not_idle() {
        let (client_outer, client_inner) = duplex(1024);
        let (backend_inner, backend_outer) = duplex(1024);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay(client_inner, backend_inner, Duration::from_millis(200), rx));

        // only the backend talks, in chunks spaced below the idle limit
        let backend = tokio::spawn(async move {
            let (_rd, mut wr) = tokio::io::split(backend_outer);
            for _ in 0..6 {
                wr.write_all(b"tick").await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            wr.shutdown().await.unwrap();
        });

        let (mut client_rd, mut client_wr) = tokio::io::split(client_outer);
        client_wr.shutdown().await.unwrap();
        let mut received = Vec::new();
        client_rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 24);

        backend.await.unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.backend_to_client, 24);
    }
}
