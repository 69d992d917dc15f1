//! Resident resources and durable tasks on top of `rtx-transact`.
//!
//! - [`TransactionalResourceService`] -- keeps loaded domain objects in a
//!   reference-counted resident cache and writes them back on last release
//! - [`TransactionalScheduler`] -- persisted delayed tasks, re-armed on start
//! - [`Resource`] / [`ResourceLoader`] -- the domain object collaborators
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtx_service::{ResourceLoader, ServiceConfig, TransactionalResourceService};
//! use rtx_store::{DataStore, InMemoryDataStore};
//! use rtx_transact::{TransactConfig, TransactionalPersistence};
//!
//! # fn run(loader: Arc<dyn ResourceLoader>) -> rtx_service::ServiceResult<()> {
//! let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
//! let persistence = TransactionalPersistence::open(store, &TransactConfig::default())?;
//! persistence.start()?;
//!
//! let service = TransactionalResourceService::new(persistence, loader, &ServiceConfig::default())?;
//! service.start()?;
//! let player = service.acquire(&"/players/alice".parse()?)?;
//! player.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod resource;
pub mod scheduler;
pub mod service;

pub use cache::ResidentCache;
pub use cleanup::CleanupChain;
pub use config::{RetryPolicy, ServiceConfig};
pub use error::{ServiceError, ServiceResult};
pub use resource::{Release, Resource, ResourceLoader, TransactionalResource};
pub use scheduler::{now_millis, TaskHandler, TransactionalScheduler};
pub use service::{ResourceAcquisition, ResourceTransaction, TransactionalResourceService};
