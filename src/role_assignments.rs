//! Role-based access control: DTOs, manager and fluent definition.
//!
//! Unique responsibility: create, find and delete role assignments through the
//! `Microsoft.Authorization` provider.
//!
//! REST endpoints (api-version 2022-04-01):
//! - PUT    {scope}/providers/Microsoft.Authorization/roleAssignments/{name}
//! - GET    {scope}/providers/Microsoft.Authorization/roleAssignments/{name}
//! - DELETE {roleAssignmentId}
//! - GET    {scope}/providers/Microsoft.Authorization/roleAssignments?$filter=atScope()
//! - GET    {scope}/providers/Microsoft.Authorization/roleDefinitions?$filter=roleName eq '{name}'
//!
//! Definitions are built with a typestate chain so an assignment cannot be created
//! before principal, role and scope are set:
//!
//! ```ignore
//! let assignment = role_assignments
//!     .define(uuid::Uuid::new_v4().to_string())
//!     .for_object_id(principal_id)
//!     .with_built_in_role(BuiltInRole::Reader)
//!     .with_scope(scope)
//!     .create()
//!     .await?;
//! ```

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::azure_client::{ArmClient, ArmError};

/// API version of the `Microsoft.Authorization` provider.
pub const AUTHORIZATION_API_VERSION: &str = "2022-04-01";

/// Error code returned when the same assignment already exists.
pub const ROLE_ASSIGNMENT_EXISTS: &str = "RoleAssignmentExists";

/// Error code returned while a new principal has not replicated yet.
pub const PRINCIPAL_NOT_FOUND: &str = "PrincipalNotFound";

// ============================================================================
// DTOs
// ============================================================================

/// A role assignment resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    /// Full resource id.
    pub id: String,
    /// Assignment name (a GUID).
    pub name: String,
    /// Resource type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Assignment properties.
    pub properties: RoleAssignmentProperties,
}

/// Properties of a role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignmentProperties {
    /// Scope the assignment applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Id of the assigned role definition.
    pub role_definition_id: String,
    /// Object id of the principal.
    pub principal_id: String,
    /// Principal type (`User`, `Group`, `ServicePrincipal`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_type: Option<String>,
}

impl RoleAssignment {
    /// Scope of the assignment.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.properties.scope.as_deref()
    }

    /// Assigned role definition id.
    #[must_use]
    pub fn role_definition_id(&self) -> &str {
        &self.properties.role_definition_id
    }

    /// Principal the role is assigned to.
    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.properties.principal_id
    }
}

/// Body of a role assignment PUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignmentCreateParameters {
    /// Assignment properties.
    pub properties: RoleAssignmentCreateProperties,
}

/// Properties sent when creating a role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignmentCreateProperties {
    /// Id of the role definition to assign.
    pub role_definition_id: String,
    /// Object id of the principal.
    pub principal_id: String,
}

impl RoleAssignmentCreateParameters {
    /// Build create parameters.
    #[must_use]
    pub fn new(role_definition_id: impl Into<String>, principal_id: impl Into<String>) -> Self {
        Self {
            properties: RoleAssignmentCreateProperties {
                role_definition_id: role_definition_id.into(),
                principal_id: principal_id.into(),
            },
        }
    }
}

/// A role definition resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinition {
    /// Full resource id.
    pub id: String,
    /// Definition name (a GUID).
    pub name: String,
    /// Resource type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Definition properties.
    pub properties: RoleDefinitionProperties,
}

/// Properties of a role definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinitionProperties {
    /// Display name, e.g. `Reader`.
    pub role_name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `BuiltInRole` or `CustomRole`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub role_type: Option<String>,
    /// Scopes the definition can be assigned at.
    #[serde(default)]
    pub assignable_scopes: Vec<String>,
}

/// Well-known built-in roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuiltInRole {
    /// Full access including access management.
    Owner,
    /// Full access without access management.
    Contributor,
    /// Read-only access.
    Reader,
    /// Manage user access.
    UserAccessAdministrator,
    /// Read, write and delete blob data.
    StorageBlobDataContributor,
    /// Full blob data access including POSIX ACLs.
    StorageBlobDataOwner,
    /// Read blob data.
    StorageBlobDataReader,
    /// Full Key Vault data-plane access.
    KeyVaultAdministrator,
    /// Read Key Vault secrets.
    KeyVaultSecretsUser,
    /// Manage networks.
    NetworkContributor,
    /// Manage virtual machines.
    VirtualMachineContributor,
    /// Manage websites.
    WebsiteContributor,
    /// Manage SQL databases.
    SqlDbContributor,
    /// Read monitoring data.
    MonitoringReader,
    /// Pull container images.
    AcrPull,
    /// Any other role, by display name.
    Custom(String),
}

impl BuiltInRole {
    const KNOWN: [Self; 15] = [
        Self::Owner,
        Self::Contributor,
        Self::Reader,
        Self::UserAccessAdministrator,
        Self::StorageBlobDataContributor,
        Self::StorageBlobDataOwner,
        Self::StorageBlobDataReader,
        Self::KeyVaultAdministrator,
        Self::KeyVaultSecretsUser,
        Self::NetworkContributor,
        Self::VirtualMachineContributor,
        Self::WebsiteContributor,
        Self::SqlDbContributor,
        Self::MonitoringReader,
        Self::AcrPull,
    ];

    /// Display name used in `roleName eq '...'` filters.
    #[must_use]
    pub fn role_name(&self) -> &str {
        match self {
            Self::Owner => "Owner",
            Self::Contributor => "Contributor",
            Self::Reader => "Reader",
            Self::UserAccessAdministrator => "User Access Administrator",
            Self::StorageBlobDataContributor => "Storage Blob Data Contributor",
            Self::StorageBlobDataOwner => "Storage Blob Data Owner",
            Self::StorageBlobDataReader => "Storage Blob Data Reader",
            Self::KeyVaultAdministrator => "Key Vault Administrator",
            Self::KeyVaultSecretsUser => "Key Vault Secrets User",
            Self::NetworkContributor => "Network Contributor",
            Self::VirtualMachineContributor => "Virtual Machine Contributor",
            Self::WebsiteContributor => "Website Contributor",
            Self::SqlDbContributor => "SQL DB Contributor",
            Self::MonitoringReader => "Monitoring Reader",
            Self::AcrPull => "AcrPull",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for BuiltInRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role_name())
    }
}

impl FromStr for BuiltInRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Ok(Self::KNOWN
            .into_iter()
            .find(|r| r.role_name().eq_ignore_ascii_case(trimmed))
            .unwrap_or_else(|| Self::Custom(trimmed.to_string())))
    }
}

// ============================================================================
// API seam
// ============================================================================

/// Operations on role assignments and definitions.
#[async_trait]
pub trait RoleAssignmentApi: Send + Sync {
    /// Create (PUT) an assignment named `name` at `scope`.
    async fn create(
        &self,
        scope: &str,
        name: &str,
        params: &RoleAssignmentCreateParameters,
    ) -> Result<RoleAssignment, ArmError>;

    /// Get an assignment by scope and name.
    async fn get(&self, scope: &str, name: &str) -> Result<Option<RoleAssignment>, ArmError>;

    /// Delete an assignment by its full id. Returns `false` if it did not exist.
    async fn delete_by_id(&self, id: &str) -> Result<bool, ArmError>;

    /// List assignments defined at exactly `scope`.
    async fn list_by_scope(&self, scope: &str) -> Result<Vec<RoleAssignment>, ArmError>;

    /// Find a role definition by display name, as seen from `scope`.
    async fn role_definition_by_scope_and_role_name(
        &self,
        scope: &str,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>, ArmError>;
}

/// ARM-backed role assignment manager.
pub struct RoleAssignments {
    client: Arc<ArmClient>,
    principal_retry_max: u32,
    principal_retry_unit: Duration,
}

impl RoleAssignments {
    /// Create a manager over `client`.
    #[must_use]
    pub const fn new(client: Arc<ArmClient>) -> Self {
        Self {
            client,
            principal_retry_max: 30,
            principal_retry_unit: Duration::from_secs(1),
        }
    }

    /// Tune the `PrincipalNotFound` retry: attempt `i` waits `i * unit`.
    #[must_use]
    pub const fn with_principal_retry(mut self, max: u32, unit: Duration) -> Self {
        self.principal_retry_max = max;
        self.principal_retry_unit = unit;
        self
    }

    /// Begin the definition of a new assignment named `name`.
    pub fn define(&self, name: impl Into<String>) -> RoleAssignmentDefinition<'_, NeedsPrincipal> {
        RoleAssignmentDefinition::new(self, name)
    }
}

fn assignment_path(scope: &str, name: &str) -> String {
    format!(
        "{}/providers/Microsoft.Authorization/roleAssignments/{name}",
        scope.trim_end_matches('/')
    )
}

#[async_trait]
impl RoleAssignmentApi for RoleAssignments {
    async fn create(
        &self,
        scope: &str,
        name: &str,
        params: &RoleAssignmentCreateParameters,
    ) -> Result<RoleAssignment, ArmError> {
        let path = assignment_path(scope, name);
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            match self
                .client
                .put_json(&path, AUTHORIZATION_API_VERSION, params)
                .await
            {
                Err(e) if e.has_code(PRINCIPAL_NOT_FOUND) && attempt < self.principal_retry_max => {
                    tracing::info!(
                        principal = %params.properties.principal_id,
                        attempt,
                        "principal not replicated yet, retrying role assignment"
                    );
                    tokio::time::sleep(self.principal_retry_unit.saturating_mul(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn get(&self, scope: &str, name: &str) -> Result<Option<RoleAssignment>, ArmError> {
        self.client
            .get_optional_json(&assignment_path(scope, name), AUTHORIZATION_API_VERSION)
            .await
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, ArmError> {
        self.client.delete(id, AUTHORIZATION_API_VERSION).await
    }

    async fn list_by_scope(&self, scope: &str) -> Result<Vec<RoleAssignment>, ArmError> {
        let path = format!(
            "{}/providers/Microsoft.Authorization/roleAssignments",
            scope.trim_end_matches('/')
        );
        self.client
            .list_json(&path, AUTHORIZATION_API_VERSION, Some("atScope()"))
            .await
    }

    async fn role_definition_by_scope_and_role_name(
        &self,
        scope: &str,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>, ArmError> {
        let path = format!(
            "{}/providers/Microsoft.Authorization/roleDefinitions",
            scope.trim_end_matches('/')
        );
        let filter = format!("roleName eq '{}'", role_name.replace('\'', "''"));
        let defs: Vec<RoleDefinition> = self
            .client
            .list_json(&path, AUTHORIZATION_API_VERSION, Some(&filter))
            .await?;
        Ok(defs.into_iter().next())
    }
}

// ============================================================================
// Fluent definition
// ============================================================================

/// How the role of a new assignment is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleReference {
    /// By display name, resolved at the assignment scope.
    Name(String),
    /// By role definition id.
    DefinitionId(String),
}

/// Stage: the principal is not set yet.
#[derive(Debug)]
pub struct NeedsPrincipal;

/// Stage: principal set, role missing.
#[derive(Debug)]
pub struct NeedsRole {
    principal_id: String,
}

/// Stage: principal and role set, scope missing.
#[derive(Debug)]
pub struct NeedsScope {
    principal_id: String,
    role: RoleReference,
}

/// Stage: ready to create.
#[derive(Debug)]
pub struct ReadyToCreate {
    principal_id: String,
    role: RoleReference,
    scope: String,
}

/// A role assignment being defined.
pub struct RoleAssignmentDefinition<'a, S> {
    api: &'a dyn RoleAssignmentApi,
    name: String,
    stage: S,
}

impl<'a> RoleAssignmentDefinition<'a, NeedsPrincipal> {
    /// Start a definition against any `RoleAssignmentApi`.
    pub fn new(api: &'a dyn RoleAssignmentApi, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
            stage: NeedsPrincipal,
        }
    }

    /// Assign to the principal with this object id.
    pub fn for_object_id(self, principal_id: impl Into<String>) -> RoleAssignmentDefinition<'a, NeedsRole> {
        RoleAssignmentDefinition {
            api: self.api,
            name: self.name,
            stage: NeedsRole {
                principal_id: principal_id.into(),
            },
        }
    }
}

impl<'a> RoleAssignmentDefinition<'a, NeedsRole> {
    /// Assign a built-in role.
    #[must_use]
    pub fn with_built_in_role(self, role: &BuiltInRole) -> RoleAssignmentDefinition<'a, NeedsScope> {
        self.with_role(RoleReference::Name(role.role_name().to_string()))
    }

    /// Assign the role definition with this id.
    pub fn with_role_definition(self, definition_id: impl Into<String>) -> RoleAssignmentDefinition<'a, NeedsScope> {
        self.with_role(RoleReference::DefinitionId(definition_id.into()))
    }

    fn with_role(self, role: RoleReference) -> RoleAssignmentDefinition<'a, NeedsScope> {
        RoleAssignmentDefinition {
            api: self.api,
            name: self.name,
            stage: NeedsScope {
                principal_id: self.stage.principal_id,
                role,
            },
        }
    }
}

impl<'a> RoleAssignmentDefinition<'a, NeedsScope> {
    /// Limit the assignment to `scope` (an ARM resource id).
    pub fn with_scope(self, scope: impl Into<String>) -> RoleAssignmentDefinition<'a, ReadyToCreate> {
        RoleAssignmentDefinition {
            api: self.api,
            name: self.name,
            stage: ReadyToCreate {
                principal_id: self.stage.principal_id,
                role: self.stage.role,
                scope: scope.into(),
            },
        }
    }
}

impl RoleAssignmentDefinition<'_, ReadyToCreate> {
    /// Create the assignment, resolving role names to definition ids first.
    ///
    /// # Errors
    ///
    /// Returns `ArmError::NotFound` if a role name cannot be resolved at the scope,
    /// or any error from the create call.
    pub async fn create(self) -> Result<RoleAssignment, ArmError> {
        let ReadyToCreate {
            principal_id,
            role,
            scope,
        } = self.stage;

        let role_definition_id = match role {
            RoleReference::DefinitionId(id) => id,
            RoleReference::Name(role_name) => self
                .api
                .role_definition_by_scope_and_role_name(&scope, &role_name)
                .await?
                .map(|d| d.id)
                .ok_or_else(|| ArmError::NotFound(format!("role definition '{role_name}' at scope '{scope}'")))?,
        };

        tracing::debug!(name = %self.name, %scope, %principal_id, "creating role assignment");
        let params = RoleAssignmentCreateParameters::new(role_definition_id, principal_id);
        self.api.create(&scope, &self.name, &params).await
    }
}

// ============================================================================
// In-memory API for tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::InMemoryRoleApi;
    use super::*;

    const SCOPE: &str = "/subscriptions/s/resourceGroups/rg";

    #[test]
    fn role_assignment_json_round_trips_wire_names() {
        let raw = r#"{
            "id": "/subscriptions/s/providers/Microsoft.Authorization/roleAssignments/a1",
            "name": "a1",
            "type": "Microsoft.Authorization/roleAssignments",
            "properties": {
                "scope": "/subscriptions/s",
                "roleDefinitionId": "/providers/Microsoft.Authorization/roleDefinitions/r1",
                "principalId": "p1",
                "principalType": "ServicePrincipal"
            }
        }"#;
        let parsed: RoleAssignment = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.principal_id(), "p1");
        assert_eq!(parsed.scope(), Some("/subscriptions/s"));

        let body = serde_json::to_value(RoleAssignmentCreateParameters::new("r1", "p1")).unwrap();
        assert_eq!(body["properties"]["roleDefinitionId"], "r1");
        assert_eq!(body["properties"]["principalId"], "p1");
    }

    #[test]
    fn built_in_roles_parse_case_insensitively() {
        assert_eq!("reader".parse::<BuiltInRole>().unwrap(), BuiltInRole::Reader);
        assert_eq!(
            "storage blob data contributor".parse::<BuiltInRole>().unwrap(),
            BuiltInRole::StorageBlobDataContributor
        );
        assert_eq!(
            "Cosmos Operator".parse::<BuiltInRole>().unwrap(),
            BuiltInRole::Custom("Cosmos Operator".into())
        );
        assert_eq!(BuiltInRole::UserAccessAdministrator.to_string(), "User Access Administrator");
    }

    #[test]
    fn assignment_path_trims_trailing_slash() {
        assert_eq!(
            assignment_path("/subscriptions/s/", "n1"),
            "/subscriptions/s/providers/Microsoft.Authorization/roleAssignments/n1"
        );
    }

    #[tokio::test]
    async fn fluent_definition_resolves_role_names() {
        let api = InMemoryRoleApi::with_roles(&["Reader", "Contributor"]);

        let created = RoleAssignmentDefinition::new(&api, "name-1")
            .for_object_id("principal-1")
            .with_built_in_role(&BuiltInRole::Contributor)
            .with_scope(SCOPE)
            .create()
            .await
            .unwrap();

        assert_eq!(created.principal_id(), "principal-1");
        assert!(created.role_definition_id().ends_with("def-1"));
        assert_eq!(created.scope(), Some(SCOPE));
        assert!(api.get(SCOPE, "name-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fluent_definition_accepts_definition_ids() {
        let api = InMemoryRoleApi::default();
        let created = RoleAssignmentDefinition::new(&api, "name-2")
            .for_object_id("principal-2")
            .with_role_definition("/custom/def")
            .with_scope(SCOPE)
            .create()
            .await
            .unwrap();
        assert_eq!(created.role_definition_id(), "/custom/def");
    }

    #[tokio::test]
    async fn unknown_role_name_is_not_found() {
        let api = InMemoryRoleApi::default();
        let err = RoleAssignmentDefinition::new(&api, "name-3")
            .for_object_id("p")
            .with_built_in_role(&BuiltInRole::Owner)
            .with_scope(SCOPE)
            .create()
            .await
            .unwrap_err();
        assert!(matches!(err, ArmError::NotFound(msg) if msg.contains("Owner")));
        assert_eq!(*api.create_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_assignment_reports_conflict_code() {
        let api = InMemoryRoleApi::with_roles(&["Reader"]);
        for name in ["first", "second"] {
            let res = RoleAssignmentDefinition::new(&api, name)
                .for_object_id("p")
                .with_built_in_role(&BuiltInRole::Reader)
                .with_scope(SCOPE)
                .create()
                .await;
            if name == "second" {
                assert!(res.unwrap_err().has_code(ROLE_ASSIGNMENT_EXISTS));
            } else {
                res.unwrap();
            }
        }
        assert_eq!(api.list_by_scope(SCOPE).await.unwrap().len(), 1);
    }
}
