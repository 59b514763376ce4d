//! Role bindings for a managed identity, scheduled on a task group.
//!
//! The identity (user-assigned identity, VM, web app, ...) is usually the root task of
//! a group, so its principal id only exists after the root ran. The helper therefore
//! queues post-run tasks that read the principal id through an `IdProvider` at
//! invocation time.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    resource_id,
    role_assignments::{
        BuiltInRole, RoleAssignment, RoleAssignmentApi, RoleAssignmentDefinition, ROLE_ASSIGNMENT_EXISTS,
    },
    task_group::{BoxError, FunctionalTaskItem, InvocationContext, TaskGroup, TaskGroupError},
};

/// Source of the identity's ids, read when the role tasks run.
pub trait IdProvider: Send + Sync {
    /// Object id of the identity's service principal, once known.
    fn principal_id(&self) -> Option<String>;

    /// ARM resource id of the resource owning the identity, once known.
    fn resource_id(&self) -> Option<String>;
}

/// `IdProvider` filled in by the task that creates the identity.
#[derive(Debug, Default)]
pub struct SharedIdProvider {
    ids: Mutex<(Option<String>, Option<String>)>,
}

impl SharedIdProvider {
    /// Empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity's ids.
    pub fn set(&self, principal_id: impl Into<String>, resource_id: impl Into<String>) {
        *self.ids.lock().unwrap_or_else(PoisonError::into_inner) =
            (Some(principal_id.into()), Some(resource_id.into()));
    }
}

impl IdProvider for SharedIdProvider {
    fn principal_id(&self) -> Option<String> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).0.clone()
    }

    fn resource_id(&self) -> Option<String> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).1.clone()
    }
}

#[derive(Clone)]
enum AssignmentScope {
    Fixed(String),
    CurrentResourceGroup,
}

#[derive(Clone)]
enum AssignmentRole {
    BuiltIn(BuiltInRole),
    Definition(String),
}

/// Queues role assignment changes for an identity onto a task group.
#[derive(Clone)]
pub struct RoleAssignmentHelper {
    api: Arc<dyn RoleAssignmentApi>,
    ids: Arc<dyn IdProvider>,
}

impl RoleAssignmentHelper {
    /// Create a helper for the identity behind `ids`.
    #[must_use]
    pub fn new(api: Arc<dyn RoleAssignmentApi>, ids: Arc<dyn IdProvider>) -> Self {
        Self { api, ids }
    }

    /// Grant `role` on the resource group containing the identity's resource.
    ///
    /// Returns the key of the queued task.
    ///
    /// # Errors
    ///
    /// Returns `TaskGroupError::DuplicateKey` if the generated key collides.
    pub fn with_access_to_current_resource_group<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        role: BuiltInRole,
    ) -> Result<String, TaskGroupError> {
        self.queue_grant(group, AssignmentScope::CurrentResourceGroup, AssignmentRole::BuiltIn(role))
    }

    /// Grant `role` on `scope`.
    ///
    /// # Errors
    ///
    /// Returns `TaskGroupError::DuplicateKey` if the generated key collides.
    pub fn with_access_to<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        scope: impl Into<String>,
        role: BuiltInRole,
    ) -> Result<String, TaskGroupError> {
        self.queue_grant(group, AssignmentScope::Fixed(scope.into()), AssignmentRole::BuiltIn(role))
    }

    /// Grant the role definition `definition_id` on `scope`.
    ///
    /// # Errors
    ///
    /// Returns `TaskGroupError::DuplicateKey` if the generated key collides.
    pub fn with_access_to_role_definition<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        scope: impl Into<String>,
        definition_id: impl Into<String>,
    ) -> Result<String, TaskGroupError> {
        self.queue_grant(
            group,
            AssignmentScope::Fixed(scope.into()),
            AssignmentRole::Definition(definition_id.into()),
        )
    }

    fn queue_grant<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        scope: AssignmentScope,
        role: AssignmentRole,
    ) -> Result<String, TaskGroupError> {
        let name = uuid::Uuid::new_v4().to_string();
        let key = format!("rbac-grant-{name}");
        let (api, ids, task_key) = (Arc::clone(&self.api), Arc::clone(&self.ids), key.clone());

        let task = FunctionalTaskItem::new(move |ctx: InvocationContext| {
            let (api, ids) = (Arc::clone(&api), Arc::clone(&ids));
            let (scope, role, name, task_key) = (scope.clone(), role.clone(), name.clone(), task_key.clone());
            async move {
                if let Some(created) = grant(api.as_ref(), ids.as_ref(), &scope, &role, &name).await? {
                    ctx.put(task_key, serde_json::to_value(created)?);
                }
                Ok::<Option<T>, BoxError>(None)
            }
        });

        group.add_post_run_dependent(key.clone(), task)?;
        Ok(key)
    }

    /// Remove `assignment` if it belongs to this identity.
    ///
    /// Returns the key of the queued task, or `None` when the assignment belongs to
    /// another principal (or the identity's principal is not known yet).
    ///
    /// # Errors
    ///
    /// Returns `TaskGroupError::DuplicateKey` if the generated key collides.
    pub fn without_access<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        assignment: &RoleAssignment,
    ) -> Result<Option<String>, TaskGroupError> {
        let owned = self
            .ids
            .principal_id()
            .is_some_and(|p| p.eq_ignore_ascii_case(assignment.principal_id()));
        if !owned {
            return Ok(None);
        }

        let key = format!("rbac-revoke-{}", assignment.name);
        let (api, id) = (Arc::clone(&self.api), assignment.id.clone());
        let task = FunctionalTaskItem::new(move |_ctx: InvocationContext| {
            let (api, id) = (Arc::clone(&api), id.clone());
            async move {
                api.delete_by_id(&id).await?;
                Ok::<Option<T>, BoxError>(None)
            }
        });

        group.add_post_run_dependent(key.clone(), task)?;
        Ok(Some(key))
    }

    /// Remove this identity's assignment of `role` at `scope`, if any.
    ///
    /// # Errors
    ///
    /// Returns `TaskGroupError::DuplicateKey` if the generated key collides.
    pub fn without_access_to<T: Send + 'static>(
        &self,
        group: &mut TaskGroup<T>,
        scope: impl Into<String>,
        role: BuiltInRole,
    ) -> Result<String, TaskGroupError> {
        let key = format!("rbac-revoke-{}", uuid::Uuid::new_v4());
        let (api, ids, scope) = (Arc::clone(&self.api), Arc::clone(&self.ids), scope.into());

        let task = FunctionalTaskItem::new(move |_ctx: InvocationContext| {
            let (api, ids) = (Arc::clone(&api), Arc::clone(&ids));
            let (scope, role) = (scope.clone(), role.clone());
            async move {
                revoke(api.as_ref(), ids.as_ref(), &scope, &role).await?;
                Ok::<Option<T>, BoxError>(None)
            }
        });

        group.add_post_run_dependent(key.clone(), task)?;
        Ok(key)
    }
}

async fn grant(
    api: &dyn RoleAssignmentApi,
    ids: &dyn IdProvider,
    scope: &AssignmentScope,
    role: &AssignmentRole,
    name: &str,
) -> Result<Option<RoleAssignment>, BoxError> {
    let Some(principal_id) = ids.principal_id() else {
        tracing::debug!(name, "principal id unknown, skipping role assignment");
        return Ok(None);
    };

    let scope = match scope {
        AssignmentScope::Fixed(s) => s.clone(),
        AssignmentScope::CurrentResourceGroup => {
            let Some(resource) = ids.resource_id() else {
                tracing::warn!(name, "resource id unknown, skipping resource group role assignment");
                return Ok(None);
            };
            resource_id::resource_group_id(&resource)?
        }
    };

    let definition = RoleAssignmentDefinition::new(api, name).for_object_id(principal_id);
    let ready = match role {
        AssignmentRole::BuiltIn(r) => definition.with_built_in_role(r),
        AssignmentRole::Definition(id) => definition.with_role_definition(id.clone()),
    }
    .with_scope(scope.clone());

    match ready.create().await {
        Ok(created) => {
            tracing::info!(%scope, assignment = %created.name, "role assignment created");
            Ok(Some(created))
        }
        Err(e) if e.has_code(ROLE_ASSIGNMENT_EXISTS) => {
            tracing::info!(%scope, "role assignment already exists");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn revoke(
    api: &dyn RoleAssignmentApi,
    ids: &dyn IdProvider,
    scope: &str,
    role: &BuiltInRole,
) -> Result<(), BoxError> {
    let Some(principal_id) = ids.principal_id() else {
        return Ok(());
    };
    let Some(definition) = api
        .role_definition_by_scope_and_role_name(scope, role.role_name())
        .await?
    else {
        tracing::warn!(scope, role = %role, "role definition not found, nothing to revoke");
        return Ok(());
    };

    let matching = api.list_by_scope(scope).await?.into_iter().filter(|a| {
        a.role_definition_id().eq_ignore_ascii_case(&definition.id)
            && a.principal_id().eq_ignore_ascii_case(&principal_id)
    });
    for assignment in matching {
        if api.delete_by_id(&assignment.id).await? {
            tracing::info!(scope, assignment = %assignment.name, "role assignment removed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role_assignments::testing::InMemoryRoleApi;

    const IDENTITY: &str = "/subscriptions/s/resourceGroups/rg-app/providers/Microsoft.ManagedIdentity/userAssignedIdentities/id1";
    const RG: &str = "/subscriptions/s/resourceGroups/rg-app";

    fn identity_group(ids: &Arc<SharedIdProvider>, principal: &'static str) -> TaskGroup<String> {
        let ids = Arc::clone(ids);
        TaskGroup::new(
            "identity",
            FunctionalTaskItem::new(move |_ctx: InvocationContext| {
                let ids = Arc::clone(&ids);
                async move {
                    ids.set(principal, IDENTITY);
                    Ok::<_, BoxError>(Some("id1".to_string()))
                }
            }),
        )
    }

    fn setup() -> (Arc<InMemoryRoleApi>, Arc<SharedIdProvider>, RoleAssignmentHelper) {
        let api = Arc::new(InMemoryRoleApi::with_roles(&["Reader", "Contributor"]));
        let ids = Arc::new(SharedIdProvider::new());
        let helper = RoleAssignmentHelper::new(api.clone(), ids.clone());
        (api, ids, helper)
    }

    #[tokio::test]
    async fn grants_run_after_identity_is_created() {
        let (api, ids, helper) = setup();
        let mut group = identity_group(&ids, "PRINCIPAL-1");
        let rg_key = helper
            .with_access_to_current_resource_group(&mut group, BuiltInRole::Reader)
            .unwrap();
        helper
            .with_access_to(&mut group, "/subscriptions/s", BuiltInRole::Contributor)
            .unwrap();

        let ctx = InvocationContext::new();
        let outcome = group.invoke(&ctx).await.unwrap();
        assert_eq!(outcome.root_result().map(String::as_str), Some("id1"));

        let created = api.snapshot();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|a| a.principal_id() == "PRINCIPAL-1"));
        assert!(created.iter().any(|a| a.scope() == Some(RG)));

        let recorded = ctx.get(&rg_key).unwrap();
        assert_eq!(recorded["properties"]["scope"], RG);
    }

    #[tokio::test]
    async fn existing_assignment_is_not_an_error() {
        let (api, ids, helper) = setup();
        let mut group = identity_group(&ids, "p1");
        helper.with_access_to(&mut group, RG, BuiltInRole::Reader).unwrap();
        helper.with_access_to(&mut group, RG, BuiltInRole::Reader).unwrap();

        group.invoke(&InvocationContext::new()).await.unwrap();
        assert_eq!(api.snapshot().len(), 1);
        assert_eq!(*api.create_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_principal_makes_grants_no_ops() {
        let (api, _ids, helper) = setup();
        let mut group: TaskGroup<String> = TaskGroup::new(
            "noop",
            FunctionalTaskItem::new(|_ctx: InvocationContext| async { Ok::<_, BoxError>(None) }),
        );
        helper.with_access_to(&mut group, RG, BuiltInRole::Reader).unwrap();

        group.invoke(&InvocationContext::new()).await.unwrap();
        assert!(api.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_role_definition_fails_the_task() {
        let (_api, ids, helper) = setup();
        let mut group = identity_group(&ids, "p1");
        let key = helper.with_access_to(&mut group, RG, BuiltInRole::Owner).unwrap();

        let err = group.invoke(&InvocationContext::new()).await.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].key, key);
    }

    #[tokio::test]
    async fn revokes_only_own_assignments() {
        let (api, ids, helper) = setup();
        ids.set("p1", IDENTITY);

        let mine = api
            .create(RG, "a-mine", &crate::role_assignments::RoleAssignmentCreateParameters::new("def-x", "P1"))
            .await
            .unwrap();
        let theirs = api
            .create(RG, "a-theirs", &crate::role_assignments::RoleAssignmentCreateParameters::new("def-x", "p2"))
            .await
            .unwrap();

        let mut group = identity_group(&ids, "p1");
        assert!(helper.without_access(&mut group, &mine).unwrap().is_some());
        assert!(helper.without_access(&mut group, &theirs).unwrap().is_none());

        group.invoke(&InvocationContext::new()).await.unwrap();
        let left = api.snapshot();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "a-theirs");
    }

    #[tokio::test]
    async fn revokes_role_at_scope() {
        let (api, ids, helper) = setup();

        let mut grant_group = identity_group(&ids, "p1");
        helper.with_access_to(&mut grant_group, RG, BuiltInRole::Reader).unwrap();
        helper.with_access_to(&mut grant_group, RG, BuiltInRole::Contributor).unwrap();
        grant_group.invoke(&InvocationContext::new()).await.unwrap();
        assert_eq!(api.snapshot().len(), 2);

        let mut revoke_group = identity_group(&ids, "p1");
        helper.without_access_to(&mut revoke_group, RG, BuiltInRole::Reader).unwrap();
        helper
            .without_access_to(&mut revoke_group, "/subscriptions/other", BuiltInRole::Reader)
            .unwrap();
        revoke_group.invoke(&InvocationContext::new()).await.unwrap();

        let left = api.snapshot();
        assert_eq!(left.len(), 1);
        assert!(left[0].role_definition_id().ends_with("def-1"));
    }
}
