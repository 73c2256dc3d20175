//! TLS-terminating reverse-proxy adapter.
//!
//! An external dispatcher hands raw connections to [`Adapter::handle`]. They
//! queue in a [`bridge::Bridge`], get their TLS terminated, and every HTTP
//! request on them is rewritten and forwarded to a single backend over
//! mutual TLS.
//!
//! ```text
//! dispatcher ──handle──▶ bridge ──accept──▶ TLS handshake ──▶ HTTP/1.1 server
//!                                                                  │
//!                          backend ◀── mTLS client ◀── rewrite ◀──┘
//! ```

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod error;
pub mod proxy;
pub mod stream;
pub mod tls;

pub use adapter::{Adapter, NAME};
pub use config::AdapterConfig;
pub use error::{Error, Result};
pub use stream::ConnMeta;
