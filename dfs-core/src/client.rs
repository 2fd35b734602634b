//! Client session against the four-node cluster
//!
//! Each command opens fresh connections to every node still considered
//! alive, then drives one task per node. Frames within a node's stream are
//! handled strictly in order; nodes are independent of each other. A node
//! that refuses the connection or exceeds the I/O timeout is marked dead and
//! skipped for the rest of the session.

use bytes::Bytes;
use futures::future::join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregateError, Catalog, CatalogListing};
use crate::fragmenter::{FragmentedFile, PartIndex, Variant};
use crate::placement::PlacementPlan;
use crate::protocol::{Command, Connection, Entry, Frame, FrameLimits, ProtocolError, Request, Upload};
use crate::registry::{Liveness, NodeEndpoint, NodeRegistry};
use crate::store::validate_name;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cannot read {path:?}: {source}")]
    ReadSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write {path:?}: {source}")]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("No storage node is reachable")]
    NoLiveNodes,

    #[error("Every reachable node rejected the upload: {failed:?}")]
    UploadRejected { failed: Vec<String> },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub limits: FrameLimits,
    pub download_dir: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(30),
            limits: FrameLimits::default(),
            download_dir: PathBuf::from("."),
        }
    }
}

/// Outcome of a `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReport {
    pub filename: String,
    pub variant: Variant,
    pub size: usize,
    /// Nodes that acknowledged both fragments
    pub stored_on: Vec<String>,
    /// Nodes skipped or timed out
    pub unreachable: Vec<String>,
    /// Nodes that answered with a protocol failure
    pub failed: Vec<String>,
    /// Parts with no acknowledged replica
    pub uncovered: Vec<PartIndex>,
}

impl PutReport {
    pub fn fully_replicated(&self) -> bool {
        self.unreachable.is_empty() && self.failed.is_empty()
    }
}

enum NodeOutcome<T> {
    Done(T),
    Failed,
    TimedOut,
}

struct NodeLink {
    index: usize,
    endpoint: NodeEndpoint,
    conn: Connection<TcpStream>,
}

/// One logged-in user's view of the cluster
pub struct ClientSession {
    registry: NodeRegistry,
    username: String,
    settings: SessionSettings,
    liveness: Liveness,
}

impl ClientSession {
    pub fn new(registry: NodeRegistry, username: impl Into<String>, settings: SessionSettings) -> Self {
        let liveness = Liveness::new(&registry);
        Self {
            registry,
            username: username.into(),
            settings,
            liveness,
        }
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.liveness.is_alive(id)
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Every file visible to this user, sorted by name
    pub async fn list(&mut self) -> Vec<CatalogListing> {
        self.collect(Command::List, None).await.listing()
    }

    /// Reconstruct `filename` in memory
    pub async fn fetch(&mut self, filename: &str) -> Result<Bytes, ClientError> {
        let catalog = self.collect(Command::Get, Some(filename)).await;
        Ok(catalog.assemble(filename)?)
    }

    /// Reconstruct `filename` into the download directory
    ///
    /// Nothing is written unless every part was recovered. The file appears
    /// under its final name only once fully written.
    pub async fn get(&mut self, filename: &str) -> Result<PathBuf, ClientError> {
        validate_name(filename).map_err(|_| ClientError::InvalidFileName(filename.to_string()))?;
        let content = self.fetch(filename).await?;

        let path = self.settings.download_dir.join(filename);
        let partial = self
            .settings
            .download_dir
            .join(format!(".{}.{}.partial", filename, std::process::id()));

        let written = async {
            tokio::fs::write(&partial, &content).await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;
        if let Err(source) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(ClientError::WriteOutput { path, source });
        }

        info!(filename = %filename, size = content.len(), "Reconstructed file written");
        Ok(path)
    }

    /// Upload the file at `path` under its base name
    pub async fn put(&mut self, path: impl AsRef<Path>) -> Result<PutReport, ClientError> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ClientError::InvalidFileName(path.display().to_string()))?
            .to_string();
        validate_name(&filename).map_err(|_| ClientError::InvalidFileName(filename.clone()))?;

        let file = FragmentedFile::from_path(path)
            .await
            .map_err(|source| ClientError::ReadSource {
                path: path.to_path_buf(),
                source,
            })?;

        self.put_fragmented(filename, file).await
    }

    /// Upload in-memory content as `filename`
    pub async fn put_bytes(
        &mut self,
        filename: &str,
        content: impl Into<Bytes>,
    ) -> Result<PutReport, ClientError> {
        validate_name(filename).map_err(|_| ClientError::InvalidFileName(filename.to_string()))?;
        self.put_fragmented(filename.to_string(), FragmentedFile::new(content))
            .await
    }

    async fn put_fragmented(
        &mut self,
        filename: String,
        file: FragmentedFile,
    ) -> Result<PutReport, ClientError> {
        let plan = PlacementPlan::new(file.variant());
        debug!(
            filename = %filename,
            digest = %file.digest_hex(),
            variant = %file.variant(),
            size = file.len(),
            "Fragmented file"
        );

        let links = self.connect_live().await;
        if links.is_empty() {
            return Err(ClientError::NoLiveNodes);
        }

        let request = Frame::Request(Request {
            command: Command::Put,
            filename: Some(filename.clone()),
            username: self.username.clone(),
        });

        let outcomes = self
            .run_on_nodes(links, |index, mut conn| {
                let request = request.clone();
                let uploads = plan.for_node(index).map(|part| {
                    Frame::Upload(Upload {
                        part,
                        payload: file.part(part).clone(),
                    })
                });
                async move {
                    conn.send(&request).await?;
                    for upload in &uploads {
                        conn.send(upload).await?;
                    }
                    conn.recv_ack().await
                }
            })
            .await;

        let mut stored = Vec::new();
        let mut report = PutReport {
            filename,
            variant: file.variant(),
            size: file.len(),
            stored_on: Vec::new(),
            unreachable: Vec::new(),
            failed: Vec::new(),
            uncovered: Vec::new(),
        };

        for (index, endpoint, outcome) in outcomes {
            match outcome {
                NodeOutcome::Done(count) => {
                    debug!(node = %endpoint.id, acked = count, "Upload acknowledged");
                    stored.push(index);
                    report.stored_on.push(endpoint.id);
                }
                NodeOutcome::Failed => report.failed.push(endpoint.id),
                NodeOutcome::TimedOut => {}
            }
        }

        for (_, endpoint) in self.registry.iter() {
            if !self.liveness.is_alive(&endpoint.id) {
                report.unreachable.push(endpoint.id.clone());
            }
        }

        report.uncovered = PartIndex::ALL
            .into_iter()
            .filter(|part| !plan.holders(*part).iter().any(|h| stored.contains(h)))
            .collect();

        if report.stored_on.is_empty() {
            if report.failed.is_empty() {
                return Err(ClientError::NoLiveNodes);
            }
            return Err(ClientError::UploadRejected {
                failed: report.failed,
            });
        }

        if !report.uncovered.is_empty() {
            warn!(
                filename = %report.filename,
                uncovered = ?report.uncovered,
                "Some parts have no stored replica"
            );
        }
        info!(
            filename = %report.filename,
            stored_on = ?report.stored_on,
            "Upload finished"
        );
        Ok(report)
    }

    /// Gather every live node's directory stream into one catalog
    async fn collect(&mut self, command: Command, filename: Option<&str>) -> Catalog {
        let mut catalog = Catalog::new();

        let links = self.connect_live().await;
        if links.is_empty() {
            warn!("No storage node is reachable");
            return catalog;
        }

        let request = Frame::Request(Request {
            command,
            filename: filename.map(str::to_string),
            username: self.username.clone(),
        });

        let wanted = filename.map(str::to_string);
        let outcomes = self
            .run_on_nodes(links, |_, mut conn| {
                let request = request.clone();
                let wanted = wanted.clone();
                async move {
                    conn.send(&request).await?;
                    let mut entries: Vec<Entry> = Vec::new();
                    while let Some(mut entry) = conn.recv_entry().await? {
                        match &wanted {
                            Some(name) if entry.filename != *name => continue,
                            Some(_) => {}
                            // Listing only needs to know which parts exist
                            None => entry.payload = Bytes::new(),
                        }
                        entries.push(entry);
                    }
                    Ok::<_, ProtocolError>(entries)
                }
            })
            .await;

        for (_, endpoint, outcome) in outcomes {
            if let NodeOutcome::Done(entries) = outcome {
                debug!(node = %endpoint.id, fragments = entries.len(), "Directory received");
                catalog.extend(entries);
            }
        }

        if catalog.conflicts() > 0 {
            warn!(conflicts = catalog.conflicts(), "Replica conflicts while merging");
        }
        catalog
    }

    /// Connect to every node not yet marked dead, concurrently
    async fn connect_live(&mut self) -> Vec<NodeLink> {
        let connect_timeout = self.settings.connect_timeout;
        let limits = self.settings.limits;

        let targets: Vec<(usize, NodeEndpoint)> = self
            .registry
            .iter()
            .filter(|(_, endpoint)| self.liveness.is_alive(&endpoint.id))
            .map(|(index, endpoint)| (index, endpoint.clone()))
            .collect();

        let attempts = targets.into_iter().map(|(index, endpoint)| async move {
            let result =
                tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.socket_addr()))
                    .await;
            (index, endpoint, result)
        });

        let mut links = Vec::new();
        for (index, endpoint, result) in join_all(attempts).await {
            match result {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    links.push(NodeLink {
                        index,
                        endpoint,
                        conn: Connection::new(stream, limits),
                    });
                }
                Ok(Err(e)) => {
                    warn!(node = %endpoint.id, error = %e, "Node unreachable, skipping for this session");
                    self.liveness.mark_dead(&endpoint.id);
                }
                Err(_) => {
                    warn!(node = %endpoint.id, "Connect timed out, skipping for this session");
                    self.liveness.mark_dead(&endpoint.id);
                }
            }
        }
        links
    }

    /// Run `job` on every link in its own task, bounded by the I/O timeout
    ///
    /// A timed-out node is marked dead. A failed node only loses its
    /// contribution to the current command.
    async fn run_on_nodes<T, F, Fut>(
        &mut self,
        links: Vec<NodeLink>,
        job: F,
    ) -> Vec<(usize, NodeEndpoint, NodeOutcome<T>)>
    where
        F: Fn(usize, Connection<TcpStream>) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>> + Send + 'static,
        T: Send + 'static,
    {
        let io_timeout = self.settings.io_timeout;

        let mut meta = Vec::with_capacity(links.len());
        let mut handles = Vec::with_capacity(links.len());
        for link in links {
            let work = job(link.index, link.conn);
            handles.push(tokio::spawn(tokio::time::timeout(io_timeout, work)));
            meta.push((link.index, link.endpoint));
        }

        let mut outcomes = Vec::with_capacity(meta.len());
        for ((index, endpoint), joined) in meta.into_iter().zip(join_all(handles).await) {
            let outcome = match joined {
                Ok(Ok(Ok(value))) => NodeOutcome::Done(value),
                Ok(Ok(Err(e))) => {
                    warn!(node = %endpoint.id, error = %e, "Node stream failed, discarding its reply");
                    NodeOutcome::Failed
                }
                Ok(Err(_)) => {
                    warn!(node = %endpoint.id, "Node timed out, skipping for this session");
                    self.liveness.mark_dead(&endpoint.id);
                    NodeOutcome::TimedOut
                }
                Err(e) => {
                    warn!(node = %endpoint.id, error = %e, "Node task aborted");
                    NodeOutcome::Failed
                }
            };
            outcomes.push((index, endpoint, outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Registry whose every port refuses connections
    async fn refused_registry() -> NodeRegistry {
        let mut nodes = Vec::new();
        for n in 1..=4 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            nodes.push(NodeEndpoint::new(format!("DFS{}", n), "127.0.0.1", port));
        }
        NodeRegistry::new(nodes).unwrap()
    }

    #[tokio::test]
    async fn test_all_nodes_down() {
        let mut session = ClientSession::new(refused_registry().await, "alice", SessionSettings::default());

        assert!(session.list().await.is_empty());
        assert_eq!(session.liveness().dead_count(), 4);

        let result = session.put_bytes("f.txt", b"content".to_vec()).await;
        assert!(matches!(result, Err(ClientError::NoLiveNodes)));

        let result = session.fetch("f.txt").await;
        assert!(matches!(
            result,
            Err(ClientError::Aggregate(AggregateError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_put_missing_source_file() {
        let mut session = ClientSession::new(refused_registry().await, "alice", SessionSettings::default());
        let result = session.put("/definitely/not/here.bin").await;
        assert!(matches!(result, Err(ClientError::ReadSource { .. })));
        // Nothing was uploaded and no node was contacted
        assert_eq!(session.liveness().dead_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_file_names() {
        let mut session = ClientSession::new(refused_registry().await, "alice", SessionSettings::default());
        assert!(matches!(
            session.put_bytes("a/b", Vec::new()).await,
            Err(ClientError::InvalidFileName(_))
        ));
        assert!(matches!(
            session.get("..").await,
            Err(ClientError::InvalidFileName(_))
        ));
    }

    #[test]
    fn test_fully_replicated() {
        let report = PutReport {
            filename: "f".to_string(),
            variant: Variant::new(1).unwrap(),
            size: 3,
            stored_on: vec!["DFS1".to_string()],
            unreachable: vec!["DFS2".to_string()],
            failed: Vec::new(),
            uncovered: Vec::new(),
        };
        assert!(!report.fully_replicated());
    }
}
