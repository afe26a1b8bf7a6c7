//! Listener wrapper with connection draining.
//!
//! A [`GracefulListener`] tracks every connection it hands out. Releasing it
//! stops new accepts at once and gives the tracked connections a deadline to
//! finish on their own; whatever is still open at the deadline is shut down.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, Socket, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keep-alive period applied to every accepted connection.
pub(crate) const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Outcome of a [`GracefulListener::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections that were still open at the deadline and got shut down.
    pub forced: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

/// Registry of accepted connections.
///
/// Each entry is a duplicate of the connection's socket so the tracker can
/// shut it down without owning the stream itself.
#[derive(Default)]
struct ConnectionTracker {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, Socket>>,
    drained: Notify,
}

impl ConnectionTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Socket>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, socket: Socket) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, socket);
        id
    }

    fn forget(&self, id: u64) {
        let mut open = self.lock();
        open.remove(&id);
        if open.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.lock().len()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Shut down every connection still registered. Returns how many.
    fn force_close(&self) -> usize {
        let open = self.lock();
        for socket in open.values() {
            // The peer may already be gone; that still counts as closed.
            let _ = socket.shutdown(Shutdown::Both);
        }
        open.len()
    }
}

/// A TCP listener that can stop accepting while its connections drain.
pub struct GracefulListener {
    inner: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    stop: CancellationToken,
    tracker: Arc<ConnectionTracker>,
}

impl GracefulListener {
    pub(crate) fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            stop: CancellationToken::new(),
            tracker: Arc::new(ConnectionTracker::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of accepted connections that are still open.
    pub fn open_connections(&self) -> usize {
        self.tracker.count()
    }

    pub fn is_released(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Accept the next connection.
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] once the listener has been
    /// released or closed, including for callers already parked here.
    pub async fn accept(&self) -> io::Result<(TrackedStream, SocketAddr)> {
        let listener = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(released)?;

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return Err(released()),
            accepted = listener.accept() => accepted?,
        };

        let sock = SockRef::from(&stream);
        if let Err(err) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD)) {
            debug!(peer = %peer, error = %err, "Failed to enable keep-alive");
        }
        let id = self.tracker.track(sock.try_clone()?);

        Ok((
            TrackedStream {
                stream,
                id,
                tracker: Arc::clone(&self.tracker),
            },
            peer,
        ))
    }

    /// Stop accepting now and drain in the background.
    ///
    /// The returned task resolves once every tracked connection has closed,
    /// or once `timeout` has elapsed and the stragglers were shut down.
    pub fn release(&self, timeout: Duration) -> JoinHandle<DrainReport> {
        self.stop_accepting();
        let tracker = Arc::clone(&self.tracker);
        let addr = self.local_addr;

        tokio::spawn(async move {
            tokio::select! {
                _ = tracker.wait_drained() => {
                    debug!(address = %addr, "Listener drained");
                    DrainReport { forced: 0 }
                }
                _ = tokio::time::sleep(timeout) => {
                    let forced = tracker.force_close();
                    if forced > 0 {
                        warn!(
                            address = %addr,
                            forced_connections = forced,
                            timeout_secs = timeout.as_secs(),
                            "Drain deadline reached, closing remaining connections"
                        );
                    }
                    DrainReport { forced }
                }
            }
        })
    }

    /// Stop accepting and wait, without a deadline, for every tracked
    /// connection to close.
    pub async fn close(&self) {
        self.stop_accepting();
        let open = self.open_connections();
        if open > 0 {
            info!(address = %self.local_addr, open_connections = open, "Waiting for connections to close");
        }
        self.tracker.wait_drained().await;
    }

    fn stop_accepting(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.stop.cancel();
    }
}

impl std::fmt::Debug for GracefulListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulListener")
            .field("local_addr", &self.local_addr)
            .field("released", &self.is_released())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener released")
}

/// Normalise `:port` shorthand to an all-interfaces address.
pub(crate) fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Bind `address` in-process.
pub(crate) async fn bind(address: &str) -> io::Result<GracefulListener> {
    let listener = TcpListener::bind(normalize_address(address)).await?;
    GracefulListener::new(listener)
}

/// A connection accepted by a [`GracefulListener`].
///
/// Dropping it removes the connection from the listener's drain set.
pub struct TrackedStream {
    stream: TcpStream,
    id: u64,
    tracker: Arc<ConnectionTracker>,
}

impl TrackedStream {
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.tracker.forget(self.id);
    }
}

impl std::fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedStream")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .finish()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listener() -> GracefulListener {
        bind("127.0.0.1:0").await.unwrap()
    }

    async fn connect_n(listener: &GracefulListener, n: usize) -> (Vec<TcpStream>, Vec<TrackedStream>) {
        let mut clients = Vec::new();
        let mut accepted = Vec::new();
        for _ in 0..n {
            clients.push(TcpStream::connect(listener.local_addr()).await.unwrap());
            accepted.push(listener.accept().await.unwrap().0);
        }
        (clients, accepted)
    }

    #[test]
    fn test_normalize_port_only_address() {
        assert_eq!(normalize_address(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_address("127.0.0.1:3000"), "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_accept_tracks_connections() {
        let listener = listener().await;
        let (_clients, mut accepted) = connect_n(&listener, 3).await;
        assert_eq!(listener.open_connections(), 3);

        accepted.pop();
        assert_eq!(listener.open_connections(), 2);
    }

    #[tokio::test]
    async fn test_release_without_connections_is_clean() {
        let listener = listener().await;
        let report = listener.release(Duration::from_secs(5)).await.unwrap();
        assert!(report.is_clean());
        assert!(listener.is_released());
    }

    #[tokio::test]
    async fn test_release_drains_when_connections_close_before_deadline() {
        let listener = listener().await;
        let (_clients, accepted) = connect_n(&listener, 2).await;

        let drain = listener.release(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(accepted);

        let report = tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("drain finished before its deadline")
            .unwrap();
        assert_eq!(report, DrainReport { forced: 0 });
    }

    #[tokio::test]
    async fn test_release_forces_exactly_the_connections_still_open() {
        let listener = listener().await;
        let (mut clients, mut accepted) = connect_n(&listener, 3).await;

        // One connection finishes on its own, two outlive the deadline.
        drop(accepted.remove(0));
        let report = listener.release(Duration::from_millis(200)).await.unwrap();
        assert_eq!(report.forced, 2);

        // The forced connections are shut down from the server side.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), clients[1].read(&mut buf))
            .await
            .expect("client observed the shutdown")
            .unwrap();
        assert_eq!(read, 0);
        drop(accepted);
        assert_eq!(listener.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_accept_fails_after_release() {
        let listener = Arc::new(listener().await);

        let parked = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _drain = listener.release(Duration::from_millis(10));

        let err = parked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_waits_for_connections() {
        let listener = Arc::new(listener().await);
        let (_clients, mut accepted) = connect_n(&listener, 1).await;

        let closer = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.close().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        accepted.clear();
        tokio::time::timeout(Duration::from_secs(2), closer)
            .await
            .expect("close returned once drained")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracked_stream_reads_and_writes() {
        let listener = listener().await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
