//! Tunium - a two-node HTTP tunnel proxy
//!
//! # Architecture
//!
//! One side (on-prem) dials out to the other (cloud) and the pair holds a
//! single long-lived framed connection. Either side may then open a proxy
//! port; HTTP CONNECT clients accepted there have their byte streams
//! multiplexed over the shared link and dialed out on the opposite side.
//! No inbound port ever opens on-prem.
//!
//! ```text
//! client ── proxy listener ── ingester ─┐            ┌─ connector ── target
//!                                       │            │
//!                                    mapper ══ wire ══ mapper
//!                                       │            │
//!             session pumps ────────────┘            └──────── session pumps
//! ```
//!
//! ## Core Principles
//!
//! - The mapper on each side is the only owner of session state; everything
//!   around it is a pure I/O task connected by channels
//! - Session ids are namespaced by originating side, so the two counters
//!   never have to coordinate
//! - Per-session errors close that session; tunnel errors close everything
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address
//! ├── framing/         # Frame transports: length-prefixed, WebSocket
//! ├── transport/       # Raw connections: TCP
//! ├── session/         # Link wrapping: TLS
//! ├── tunnel/          # The multiplexer: mapper, pumps, connector
//! ├── proxy/           # CONNECT intake: listener, ingester, filter
//! └── app/             # Application: Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod framing;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod tunnel;

// Supporting modules
pub mod app;
pub mod config;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::Runtime;
pub use proxy::{BasicAuthFilter, Filter};
pub use session::Session;
pub use transport::Transport;
pub use tunnel::Tunnel;
