// src/runtime/dispatch.rs
//! Sentinel-terminated request/response exchange with one worker
//!
//! # Wire format
//!
//! ```text
//! client → worker:   <task path>\n<timeout seconds>\n
//! worker → client:   <payload of any length>__END__\n
//! ```
//!
//! Every dispatch opens a fresh TCP connection to `127.0.0.1:<port>` and
//! closes it before returning. Reading stops at the first of: end marker,
//! peer close, read error, or the caller's deadline. The marker and anything
//! after it are stripped from the payload. A marker occurring inside genuine
//! output truncates it; workers must not emit it.

use crate::utils::errors::{PoolError, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// End-of-output marker written by workers
pub const END_MARKER: &[u8] = b"__END__\n";

const READ_CHUNK: usize = 4096;

/// Cap on how far out a deadline is placed
const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Position of the first end marker in `haystack`
pub fn find_end_marker(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(END_MARKER.len())
        .position(|window| window == END_MARKER)
}

/// Talks the worker protocol over loopback TCP
#[derive(Debug, Clone)]
pub struct Dispatcher {
    host: IpAddr,
    connect_timeout: Duration,
}

impl Dispatcher {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout,
        }
    }

    /// Send `task_path` to the worker on `port` and collect its response
    ///
    /// Returns the payload with the end marker stripped. When the deadline
    /// passes before any byte arrives this is `PoolError::DispatchTimeout`;
    /// bytes received before the deadline are returned as they are.
    pub async fn dispatch(&self, port: u16, task_path: &str, timeout: Duration) -> Result<String> {
        debug!(port, task_path, ?timeout, "Sending task to worker");
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + MAX_DEADLINE);

        let mut stream = self.connect(port, started, deadline).await?;
        let exchanged = Self::exchange(&mut stream, port, task_path, timeout, deadline).await;

        // shutdown then close, whatever the exchange returned
        if let Err(e) = stream.shutdown().await {
            debug!(port, error = %e, "Socket shutdown failed");
        }
        drop(stream);

        let received = exchanged?;
        match received {
            Received::Complete(payload) | Received::Closed(payload) => Ok(decode(payload)),
            Received::Deadline(payload) if payload.is_empty() => {
                warn!(port, elapsed = ?started.elapsed(), "Worker sent nothing before the deadline");
                Err(PoolError::DispatchTimeout {
                    port,
                    elapsed: started.elapsed(),
                })
            }
            Received::Deadline(payload) => {
                warn!(port, bytes = payload.len(), "Deadline reached with a partial response");
                Ok(decode(payload))
            }
        }
    }

    /// Time allowed for connecting: the connect timeout, cut short by the deadline
    fn connect_limit(&self, deadline: Instant) -> Duration {
        self.connect_timeout
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    async fn connect(&self, port: u16, started: Instant, deadline: Instant) -> Result<TcpStream> {
        let limit = self.connect_limit(deadline);
        let connect = TcpStream::connect((self.host, port));
        let stream = match tokio::time::timeout(limit, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PoolError::Transport { port, source }),
            Err(_) if limit < self.connect_timeout => {
                warn!(port, "Deadline reached while connecting");
                return Err(PoolError::DispatchTimeout {
                    port,
                    elapsed: started.elapsed(),
                });
            }
            Err(_) => {
                return Err(PoolError::Transport {
                    port,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(port, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    async fn exchange(
        stream: &mut TcpStream,
        port: u16,
        task_path: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Received> {
        let request = format!("{}\n{}\n", task_path, timeout.as_secs());
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|source| PoolError::Transport { port, source })?;

        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Received::Deadline(buffer));
            }

            let read = match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
                Err(_) => return Ok(Received::Deadline(buffer)),
                Ok(Err(source)) => return Err(PoolError::Transport { port, source }),
                Ok(Ok(0)) => return Ok(Received::Closed(buffer)),
                Ok(Ok(n)) => n,
            };

            // the marker may straddle the previous chunk boundary
            let scan_from = buffer.len().saturating_sub(END_MARKER.len() - 1);
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = find_end_marker(&buffer[scan_from..]) {
                buffer.truncate(scan_from + pos);
                return Ok(Received::Complete(buffer));
            }
        }
    }
}

/// How the read loop ended
enum Received {
    Complete(Vec<u8>),
    Closed(Vec<u8>),
    Deadline(Vec<u8>),
}

fn decode(payload: Vec<u8>) -> String {
    match String::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Fake worker: reads the two request lines, then writes `chunks`
    async fn fake_worker(chunks: Vec<&'static [u8]>) -> (u16, oneshot::Receiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut path = String::new();
            let mut timeout = String::new();
            reader.read_line(&mut path).await.unwrap();
            reader.read_line(&mut timeout).await.unwrap();
            let _ = tx.send((path, timeout));

            for chunk in chunks {
                write_half.write_all(chunk).await.unwrap();
                write_half.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        (port, rx)
    }

    #[test]
    fn test_find_end_marker() {
        assert_eq!(find_end_marker(b"RUN_RESULT\nok\n__END__\n"), Some(14));
        assert_eq!(find_end_marker(b"__END__\n"), Some(0));
        assert_eq!(find_end_marker(b"__END__"), None);
        assert_eq!(find_end_marker(b""), None);
    }

    #[tokio::test]
    async fn test_dispatch_writes_request_lines() {
        let (port, request) = fake_worker(vec![b"RUN_RESULT\nok\n__END__\n"]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let payload = dispatcher
            .dispatch(port, "/tmp/task/Main.java", Duration::from_secs(7))
            .await
            .unwrap();
        assert_eq!(payload, "RUN_RESULT\nok\n");

        let (path, timeout) = request.await.unwrap();
        assert_eq!(path, "/tmp/task/Main.java\n");
        assert_eq!(timeout, "7\n");
    }

    #[tokio::test]
    async fn test_dispatch_strips_marker_and_trailer() {
        let (port, _) = fake_worker(vec![b"COMPILE_ERROR\nbad\n__END__\ntrailing junk"]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let payload = dispatcher.dispatch(port, "a", Duration::from_secs(2)).await.unwrap();
        assert_eq!(payload, "COMPILE_ERROR\nbad\n");
    }

    #[tokio::test]
    async fn test_dispatch_marker_split_across_chunks() {
        let (port, _) = fake_worker(vec![b"RUN_RESULT\nline\n__EN", b"D__\n"]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let payload = dispatcher.dispatch(port, "a", Duration::from_secs(2)).await.unwrap();
        assert_eq!(payload, "RUN_RESULT\nline\n");
    }

    #[tokio::test]
    async fn test_dispatch_peer_close_without_marker() {
        let (port, _) = fake_worker(vec![b"RUNTIME_ERROR\nboom\n"]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let payload = dispatcher.dispatch(port, "a", Duration::from_secs(2)).await.unwrap();
        assert_eq!(payload, "RUNTIME_ERROR\nboom\n");
    }

    #[tokio::test]
    async fn test_dispatch_silent_worker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let result = dispatcher.dispatch(port, "a", timeout).await;

        assert!(matches!(result, Err(PoolError::DispatchTimeout { .. })));
        assert!(started.elapsed() < timeout + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_dispatch_partial_response_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"RUN_RESULT\npartial").await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let payload = dispatcher
            .dispatch(port, "a", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(payload, "RUN_RESULT\npartial");
    }

    #[tokio::test]
    async fn test_dispatch_huge_timeout_does_not_overflow() {
        let (port, _) = fake_worker(vec![b"RUN_RESULT\nok\n__END__\n"]).await;
        let dispatcher = Dispatcher::new(Duration::from_secs(1));

        let payload = dispatcher
            .dispatch(port, "a", Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(payload, "RUN_RESULT\nok\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_limit_bounded_by_deadline() {
        let dispatcher = Dispatcher::new(Duration::from_secs(5));

        let near = Instant::now() + Duration::from_millis(200);
        assert_eq!(dispatcher.connect_limit(near), Duration::from_millis(200));

        let far = Instant::now() + Duration::from_secs(60);
        assert_eq!(dispatcher.connect_limit(far), Duration::from_secs(5));

        let passed = Instant::now();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(dispatcher.connect_limit(passed), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dispatch_zero_timeout_is_timeout() {
        // bound but never accepting: nothing can arrive in time
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dispatcher = Dispatcher::new(Duration::from_secs(5));
        let started = std::time::Instant::now();
        let result = dispatcher.dispatch(port, "a", Duration::ZERO).await;

        assert!(matches!(result, Err(PoolError::DispatchTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(listener);
    }

    #[tokio::test]
    async fn test_dispatch_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let dispatcher = Dispatcher::new(Duration::from_secs(1));
        let result = dispatcher.dispatch(port, "a", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::Transport { port: p, .. }) if p == port));
    }
}
