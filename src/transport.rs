//! Plain TCP implementation of the transport boundary.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::AbortHandle;
use tracing::trace;

use crate::connection::{
    CloseCallback, CloseNotifier, CloseRegistration, Connection, ConnectionId, Transport,
};
use crate::partition::PartitionKey;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const INBOUND_QUEUE_DEPTH: usize = 16;

/// Opens `tokio::net::TcpStream` connections. Secure partitions need a TLS
/// transport and are refused with [`io::ErrorKind::Unsupported`].
#[derive(Clone, Debug)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn open<'a>(
        &'a self,
        key: &'a PartitionKey,
    ) -> BoxFuture<'a, io::Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            if key.is_secure() {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "tcp transport cannot open tls connections",
                ));
            }
            let (host, port) = key.connect_target();
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(self.nodelay)?;
            let connection: Arc<dyn Connection> = TcpConnection::start(stream);
            Ok(connection)
        })
    }
}

struct TcpConnection {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    open: Arc<AtomicBool>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    inbound: AsyncMutex<mpsc::Receiver<io::Result<Bytes>>>,
    notifier: Arc<CloseNotifier>,
    reader: AbortHandle,
}

impl TcpConnection {
    fn start(stream: TcpStream) -> Arc<Self> {
        let id = ConnectionId::next();
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let open = Arc::new(AtomicBool::new(true));
        let notifier = CloseNotifier::new();
        let reader = tokio::spawn(pump_inbound(
            id,
            read_half,
            sender,
            Arc::clone(&open),
            Arc::clone(&notifier),
        ));
        Arc::new(Self {
            id,
            remote,
            open,
            writer: AsyncMutex::new(Some(write_half)),
            inbound: AsyncMutex::new(receiver),
            notifier,
            reader: reader.abort_handle(),
        })
    }
}

/// Moves socket reads into the inbound queue so that a peer close is noticed
/// even while the connection sits idle in the pool.
async fn pump_inbound(
    id: ConnectionId,
    mut read_half: OwnedReadHalf,
    sender: mpsc::Sender<io::Result<Bytes>>,
    open: Arc<AtomicBool>,
    notifier: Arc<CloseNotifier>,
) {
    loop {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                trace!(connection = %id, "peer closed connection");
                break;
            }
            Ok(_) => {
                if sender.send(Ok(buffer.freeze())).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                trace!(connection = %id, error = %error, "connection read failed");
                open.store(false, Ordering::SeqCst);
                let _ = sender.send(Err(error)).await;
                notifier.notify_remote_close();
                return;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    notifier.notify_remote_close();
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write(&self, bytes: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            if !self.is_open() {
                writer.take();
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            let Some(half) = writer.as_mut() else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            let result = half.write_all(&bytes).await;
            if result.is_err() {
                self.open.store(false, Ordering::SeqCst);
            }
            result
        })
    }

    fn read(&self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
        Box::pin(async move {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(error)) => Err(error),
                None => Ok(None),
            }
        })
    }

    fn on_remote_close(&self, callback: CloseCallback) -> CloseRegistration {
        self.notifier.subscribe(callback)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.notifier.mark_closed();
        self.reader.abort();
        // A writer busy in `write` drops its half on the next call instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        trace!(connection = %self.id, "closed connection");
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::partition::Scheme;

    async fn listener() -> (TcpListener, PartitionKey) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let port = listener.local_addr().expect("local addr").port();
        (listener, PartitionKey::new(Scheme::Http, "127.0.0.1", port))
    }

    #[tokio::test]
    async fn exchanges_bytes_with_peer() {
        let (listener, key) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buffer = [0_u8; 4];
            socket.read_exact(&mut buffer).await.expect("read ping");
            assert_eq!(&buffer, b"ping");
            socket.write_all(b"pong").await.expect("write pong");
        });

        let connection = TcpTransport::new().open(&key).await.expect("connect");
        assert!(connection.is_open());
        assert!(connection.remote_addr().is_some());
        connection
            .write(Bytes::from_static(b"ping"))
            .await
            .expect("write");
        let reply = connection.read().await.expect("read").expect("bytes");
        assert_eq!(&reply[..], b"pong");
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn peer_close_fires_callbacks_and_ends_reads() {
        let (listener, key) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            drop(socket);
        });

        let connection = TcpTransport::new().open(&key).await.expect("connect");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _registration = connection.on_remote_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        server.await.expect("server task");

        let read = tokio::time::timeout(Duration::from_secs(5), connection.read())
            .await
            .expect("read should finish");
        assert!(matches!(read, Ok(None)));
        assert!(!connection.is_open());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_does_not_fire_remote_callbacks() {
        let (listener, key) = listener().await;
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let connection = TcpTransport::new().open(&key).await.expect("connect");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _registration = connection.on_remote_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        connection.close();
        connection.close();
        assert!(!connection.is_open());
        let error = connection
            .write(Bytes::from_static(b"late"))
            .await
            .expect_err("closed connection refuses writes");
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn secure_partition_is_refused() {
        let key = PartitionKey::new(Scheme::Https, "127.0.0.1", 443);
        let error = match TcpTransport::new().open(&key).await {
            Ok(_) => panic!("tls partitions need a tls transport"),
            Err(error) => error,
        };
        assert_eq!(error.kind(), io::ErrorKind::Unsupported);
    }
}
