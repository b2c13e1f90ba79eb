//! Offline-first store of inspection fields and traps, synchronized with the
//! pest-monitoring REST backend.

pub mod auth;
pub mod camera;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod graph;
pub mod local_store;
pub mod models;
pub mod repository;
pub mod stats;
pub mod sync;
pub mod upload_queue;

pub use client::{ApiClient, RemoteGateway};
pub use config::SyncConfig;
pub use error::{ApiError, ApiResult};
pub use models::{Field, FieldPatch, PendingUpload, Trap, TrapPatch};
pub use repository::EntityRepository;
