//! Storage node: accept loop and per-connection request handling
//!
//! Every accepted connection gets its own task. A connection carries exactly
//! one request; failures close only that connection. A `put` is persisted
//! only once both uploads arrived intact.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::fragmenter::PartIndex;
use crate::metrics::Metrics;
use crate::placement::SLOTS_PER_NODE;
use crate::protocol::{Command, Connection, Entry, Frame, FrameLimits, ProtocolError, Request};
use crate::store::{validate_name, FragmentKey, NodeStore, StoreError, StoredFragment};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Peer sent nothing for {0:?}")]
    TimedOut(Duration),

    #[error("Part {0} uploaded twice")]
    DuplicatePart(PartIndex),
}

/// A bound storage node, ready to serve
pub struct NodeServer {
    listener: TcpListener,
    store: NodeStore,
    limits: FrameLimits,
    read_timeout: Duration,
    metrics: Metrics,
}

impl NodeServer {
    /// Open the store and bind the listening socket described by `config`
    pub async fn bind(config: &NodeConfig) -> Result<Self, NodeError> {
        let store = NodeStore::open(config.backend, &config.root)?;
        let listener =
            TcpListener::bind((config.listen_address.as_str(), config.listen_port)).await?;
        Ok(Self::from_parts(listener, store, config.limits, config.read_timeout()))
    }

    pub fn from_parts(
        listener: TcpListener,
        store: NodeStore,
        limits: FrameLimits,
        read_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            store,
            limits,
            read_timeout,
            metrics: Metrics::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    /// Serve until `shutdown` resolves
    ///
    /// In-flight connections keep running on their own tasks.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let store = self.store.clone();
                            let metrics = self.metrics.clone();
                            let limits = self.limits;
                            let read_timeout = self.read_timeout;

                            tokio::spawn(async move {
                                metrics.connection_opened();
                                let result =
                                    handle_connection(stream, &store, limits, read_timeout, &metrics).await;
                                if let Err(e) = result {
                                    warn!(peer = %peer, error = %e, "Connection failed");
                                }
                                metrics.connection_closed();
                            });
                        }
                        Err(e) => {
                            // Usually fd exhaustion; back off instead of spinning
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        info!(metrics = %self.metrics.snapshot(), "Node stopped");
        Ok(())
    }
}

/// Run a storage node with the given configuration until Ctrl+C
pub async fn run_node(config: NodeConfig) -> Result<(), NodeError> {
    let server = NodeServer::bind(&config).await?;

    info!("Node root: {:?}", config.root);
    info!("Storage backend: {:?}", config.backend);
    info!("Listening on {}", server.local_addr()?);

    server
        .serve_until(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await
}

/// Wait for the next inbound frame, giving up after `limit`
async fn read_within<T, F>(limit: Duration, read: F) -> Result<T, NodeError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    match tokio::time::timeout(limit, read).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NodeError::TimedOut(limit)),
    }
}

/// Serve one request on `stream`
///
/// On failure the peer gets a best-effort `Error` frame before the
/// connection is closed. A peer that stays silent longer than
/// `read_timeout` while the node waits for a frame is dropped.
pub async fn handle_connection<S>(
    stream: S,
    store: &NodeStore,
    limits: FrameLimits,
    read_timeout: Duration,
    metrics: &Metrics,
) -> Result<(), NodeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, limits);

    let result = match read_within(read_timeout, conn.recv_request()).await {
        Ok(request) => serve_request(&mut conn, request, store, read_timeout, metrics).await,
        Err(NodeError::Protocol(ProtocolError::Closed)) => {
            debug!("Peer closed without sending a request");
            return Ok(());
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        if matches!(e, NodeError::Protocol(_) | NodeError::DuplicatePart(_)) {
            metrics.protocol_error();
        }
        let _ = conn.send(&Frame::Error(e.to_string())).await;
    }
    let _ = conn.shutdown().await;

    result
}

async fn serve_request<S>(
    conn: &mut Connection<S>,
    request: Request,
    store: &NodeStore,
    read_timeout: Duration,
    metrics: &Metrics,
) -> Result<(), NodeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    validate_name(&request.username)?;
    info!(
        command = %request.command,
        user = %request.username,
        filename = request.filename.as_deref().unwrap_or(""),
        "Request"
    );

    match request.command {
        Command::List | Command::Get => {
            let keys = store.list(&request.username).await?;
            let mut count = 0;

            for key in keys {
                let payload = match store.get(key.clone()).await {
                    Ok(payload) => payload,
                    // Replaced or removed since the listing
                    Err(StoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                let size = payload.len();
                conn.send(&Frame::Entry(Entry {
                    filename: key.filename,
                    part: key.part,
                    payload,
                }))
                .await?;
                metrics.fragment_served(size);
                count += 1;
            }
            conn.send(&Frame::Done).await?;

            debug!(user = %request.username, fragments = count, "Directory streamed");
        }
        Command::Put => {
            let filename = request
                .filename
                .ok_or(ProtocolError::MissingFilename(Command::Put))?;
            validate_name(&filename)?;

            let mut fragments: Vec<StoredFragment> = Vec::with_capacity(SLOTS_PER_NODE);
            for _ in 0..SLOTS_PER_NODE {
                let upload = read_within(read_timeout, conn.recv_upload()).await?;
                if fragments.iter().any(|f| f.key.part == upload.part) {
                    return Err(NodeError::DuplicatePart(upload.part));
                }
                fragments.push(StoredFragment {
                    key: FragmentKey::new(request.username.as_str(), filename.as_str(), upload.part)?,
                    data: upload.payload,
                });
            }

            let sizes: Vec<usize> = fragments.iter().map(|f| f.data.len()).collect();
            store.put_batch(fragments).await?;
            for size in sizes {
                metrics.fragment_stored(size);
            }
            conn.send(&Frame::Ack(SLOTS_PER_NODE as u8)).await?;
        }
    }

    Ok(())
}
