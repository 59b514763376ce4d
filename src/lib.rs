//! Azure management starter - segmented Data Lake Store uploads and RBAC provisioning.
//!
//! The crate has two halves:
//! - **Upload**: split a local file into record-aligned segments, upload them in
//!   parallel through the Data Lake Store `WebHDFS` endpoint, and join them into the
//!   target stream. Interrupted uploads resume from a local metadata file.
//! - **Management**: an ARM REST client, role assignment manager and a dependency
//!   ordered task group used to provision role bindings for an identity.
//!
//! ## Quick Start
//!
//! All configuration is loaded from environment variables. Create a `.env` file:
//!
//! ```text
//! AZURE_TENANT_ID=00000000-0000-0000-0000-000000000000
//! AZURE_CLIENT_ID=00000000-0000-0000-0000-000000000000
//! AZURE_CLIENT_SECRET=your_secret_here
//! ADLS_ACCOUNT_NAME=mylake
//! ADLS_INPUT_FILE=./data/events.csv
//! ADLS_TARGET_STREAM=/raw/events.csv
//! ```
//!
//! Then run an upload:
//!
//! ```ignore
//! use std::sync::Arc;
//! use azure_mgmt_starter::{
//!     ClientSecretCredential, CredentialConfig, DataLakeStoreFrontEnd, DataLakeUploader,
//!     StoreConfig, UploadParameters,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credential = Arc::new(ClientSecretCredential::new(CredentialConfig::from_env()?)?);
//!     let front_end = DataLakeStoreFrontEnd::new(StoreConfig::from_env()?, credential)?;
//!
//!     let uploader = DataLakeUploader::new(UploadParameters::from_env()?, Arc::new(front_end));
//!     let summary = uploader.execute().await?;
//!     println!("uploaded {} bytes to {}", summary.file_length, summary.target_stream_path);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Linting
// ============================================================================

#![deny(warnings)]                    // Warnings fail the build
#![deny(unsafe_code)]                 // No unsafe anywhere
#![deny(missing_docs)]                // Public items carry docs
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(unused_must_use)]             // Results and futures are handled
#![deny(nonstandard_style)]

// Clippy
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))] // Tests may unwrap
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(clippy::print_stdout)]        // Report through tracing
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::redundant_clone)]
#![deny(clippy::too_many_arguments)]

// Arithmetic
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Modules
// ============================================================================

/// Environment variable helpers shared by every `from_env()`.
pub mod env_config;

/// Azure AD client-secret credential with a per-scope token cache.
pub mod azure_auth;

/// ARM REST client with retry and pagination.
pub mod azure_client;

/// ARM resource id parsing.
pub mod resource_id;

/// Dependency-ordered execution of async tasks.
pub mod task_group;

/// Role assignment DTOs, manager and fluent definition.
pub mod role_assignments;

/// Role bindings for an identity, queued on a task group.
pub mod role_assignment_helper;

/// Errors of the upload pipeline.
pub mod upload_error;

/// Parameters of an upload.
pub mod upload_parameters;

/// Record terminator search used to align segments.
pub mod record_boundary;

/// Persisted upload layout and segment progress.
pub mod upload_metadata;

/// Creation and reload of upload metadata.
pub mod upload_metadata_generator;

/// Data Lake Store data plane (`WebHDFS`) and an in-memory store.
pub mod store_front_end;

/// Single and parallel segment uploads.
pub mod segment_uploader;

/// Upload orchestration from local file to target stream.
pub mod data_lake_uploader;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use azure_auth::{ClientSecretCredential, CredentialConfig, StaticTokenCredential, TokenCredential};
pub use azure_client::{ArmClient, ArmClientConfig, ArmError};
pub use data_lake_uploader::{DataLakeUploader, UploadSummary};
pub use resource_id::ResourceId;
pub use role_assignment_helper::{IdProvider, RoleAssignmentHelper, SharedIdProvider};
pub use role_assignments::{BuiltInRole, RoleAssignment, RoleAssignmentApi, RoleAssignments};
pub use segment_uploader::{MultipleSegmentUploader, SingleSegmentUploader, UploadProgress};
pub use store_front_end::{DataLakeStoreFrontEnd, FrontEndAdapter, FrontEndError, InMemoryFrontEnd, StoreConfig};
pub use task_group::{FunctionalTaskItem, InvocationContext, TaskGroup, TaskGroupError, TaskItem};
pub use upload_error::UploadError;
pub use upload_metadata::{SegmentStatus, UploadMetadata};
pub use upload_metadata_generator::UploadMetadataGenerator;
pub use upload_parameters::UploadParameters;
