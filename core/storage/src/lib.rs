//! Storage access layer for azkeep.
//!
//! Tables of entities and blobs in containers, reached through a
//! [`StorageFacade`] that creates tables and containers on first write.
//!
//! # Layers
//! - `config`: credential resolution (environment, then deployment config)
//! - `handle`: turns credentials into table and blob clients
//! - `provisioner`: create-if-not-exists for tables and containers
//! - `facade`: the query, insert, upsert, delete and upload operations
//! - `azure` / `memory`: the backends behind [`TableBackend`] and [`BlobBackend`]

pub mod azure;
pub mod backend;
pub mod config;
pub mod facade;
pub mod filter;
pub mod handle;
pub mod memory;
pub mod provisioner;
pub mod registry;

pub use azure::AzureConfig;
pub use backend::{BlobBackend, ContinuationToken, PublicAccess, Query, QueryPage, TableBackend};
pub use config::{CredentialSource, Credentials, DeploymentConfig};
pub use facade::StorageFacade;
pub use filter::Filter;
pub use handle::{AzureHandleProvider, BlobHandleProvider, MemoryHandleProvider, TableHandleProvider};
pub use memory::MemoryStorage;
pub use provisioner::ResourceProvisioner;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
