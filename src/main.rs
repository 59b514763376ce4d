//! Command-line entry point: upload one file to Data Lake Store.
//!
//! ## Usage
//!
//! 1. Create a `.env` file with the credential, `ADLS_*` settings and optionally
//!    `AZURE_ROLE_ASSIGNEE_OBJECT_ID` / `AZURE_ROLE_SCOPE` / `AZURE_ROLE_NAME`
//! 2. Run: `cargo run`
//!
//! Set `RUST_LOG=debug` for per-segment logs.

#![allow(clippy::print_stdout)] // The binary reports its result on stdout

use std::sync::Arc;

use azure_mgmt_starter::{
    ArmClient, ArmClientConfig, BuiltInRole, ClientSecretCredential, CredentialConfig, DataLakeStoreFrontEnd,
    DataLakeUploader, FunctionalTaskItem, InvocationContext, RoleAssignmentHelper, RoleAssignments,
    SharedIdProvider, StoreConfig, TaskGroup, TokenCredential, UploadParameters, env_config, task_group::BoxError,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let credential: Arc<dyn TokenCredential> = Arc::new(ClientSecretCredential::new(CredentialConfig::from_env()?)?);
    let store = StoreConfig::from_env()?;
    let params = UploadParameters::from_env()?;

    println!("Uploading:");
    println!("  Input: {}", params.input_file_path.display());
    println!("  Target: adl://{}{}", store.account_name, params.target_stream_path);
    println!("  Threads: {}", params.thread_count);

    let front_end = DataLakeStoreFrontEnd::new(store, Arc::clone(&credential))?;
    let summary = DataLakeUploader::new(params, Arc::new(front_end)).execute().await?;

    println!("\nUpload complete!");
    println!("  Upload id: {}", summary.upload_id);
    println!("  Bytes: {}", summary.file_length);
    println!("  Segments: {}", summary.segment_count);
    println!("  Resumed: {}", summary.resumed);

    if let (Some(principal), Some(scope)) = (
        env_config::optional_env("AZURE_ROLE_ASSIGNEE_OBJECT_ID"),
        env_config::optional_env("AZURE_ROLE_SCOPE"),
    ) {
        let role: BuiltInRole = env_config::string_env("AZURE_ROLE_NAME", "Reader").parse()?;
        grant_role(credential, principal, scope, role).await?;
    }

    Ok(())
}

async fn grant_role(
    credential: Arc<dyn TokenCredential>,
    principal: String,
    scope: String,
    role: BuiltInRole,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(ArmClient::new(ArmClientConfig::from_env()?, credential)?);
    let ids = Arc::new(SharedIdProvider::new());

    // The root publishes the assignee; the grant runs after it.
    let (root_ids, root_scope) = (Arc::clone(&ids), scope.clone());
    let root = FunctionalTaskItem::new(move |_ctx: InvocationContext| {
        let (ids, principal, scope) = (Arc::clone(&root_ids), principal.clone(), root_scope.clone());
        async move {
            ids.set(principal.clone(), scope);
            Ok::<Option<String>, BoxError>(Some(principal))
        }
    });

    let mut group = TaskGroup::new("assignee", root);
    let helper = RoleAssignmentHelper::new(Arc::new(RoleAssignments::new(client)), ids);
    let key = helper.with_access_to(&mut group, scope.clone(), role.clone())?;

    let outcome = group.invoke(&InvocationContext::new()).await?;
    println!("\nRole granted:");
    println!("  Principal: {}", outcome.root_result().map_or("-", String::as_str));
    println!("  Role: {role}");
    println!("  Scope: {scope}");
    println!("  Task: {key}");
    Ok(())
}
