//! DFS Core
//!
//! Fragmentation, placement, wire protocol, node storage and client-side
//! reconstruction for a four-node replicated file store.

pub mod aggregator;
pub mod auth;
pub mod client;
pub mod config;
pub mod fragmenter;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod protocol;
pub mod registry;
pub mod store;

pub use aggregator::{AggregateError, Catalog, CatalogEntry, CatalogListing};
pub use auth::{AuthError, Credentials};
pub use client::{ClientError, ClientSession, PutReport, SessionSettings};
pub use config::{ClientConfig, ConfigError, Invocation, NodeConfig};
pub use fragmenter::{FragmentedFile, PartIndex, Variant, FRAGMENT_COUNT};
pub use metrics::{Metrics, MetricsSnapshot};
pub use node::{handle_connection, run_node, NodeError, NodeServer};
pub use placement::{assign, PlacementPlan, NODE_COUNT};
pub use protocol::{Command, Connection, Frame, FrameLimits, ProtocolError};
pub use registry::{Liveness, NodeEndpoint, NodeRegistry, RegistryError};
pub use store::{FragmentKey, NodeStore, StoreBackend, StoreError, StoredFragment};
