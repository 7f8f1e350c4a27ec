//! Credential pool and multi-backend dispatch engine for image generation.
//!
//! Brokers logical generation requests across heterogeneous HTTP backends:
//! a channel registry describes where and how to talk to each backend, a
//! credential pool rotates API keys and sidelines the ones that keep
//! failing, the adapter layer translates to and from each backend's wire
//! format, and the dispatch engine ties it together with bounded two-level
//! failover.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod persist;
pub mod pool;
pub mod registry;

pub use adapter::{GenerateRequest, GeneratedImage, SourceImage};
pub use config::EngineConfig;
pub use engine::DispatchEngine;
pub use error::{EngineError, Result};
pub use persist::{JsonFileStore, NullStore, StateSnapshot, StateStore};
pub use pool::{CredentialInfo, CredentialPool, Threshold};
pub use registry::{Channel, ChannelKind, ChannelRegistry};
