//! Identity provisioning followed by role grants, run through a task group.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use azure_mgmt_starter::{
    ArmError, BuiltInRole, FunctionalTaskItem, IdProvider, InvocationContext, RoleAssignment, RoleAssignmentApi,
    RoleAssignmentHelper, SharedIdProvider, TaskGroup, TaskGroupError,
    role_assignments::{RoleAssignmentCreateParameters, RoleAssignmentProperties, RoleDefinition, RoleDefinitionProperties},
    task_group::BoxError,
};

const IDENTITY_ID: &str =
    "/subscriptions/sub-1/resourceGroups/rg-app/providers/Microsoft.ManagedIdentity/userAssignedIdentities/app-id";

#[derive(Default)]
struct RecordingApi {
    created: Mutex<Vec<(String, RoleAssignmentCreateParameters)>>,
}

#[async_trait]
impl RoleAssignmentApi for RecordingApi {
    async fn create(
        &self,
        scope: &str,
        name: &str,
        params: &RoleAssignmentCreateParameters,
    ) -> Result<RoleAssignment, ArmError> {
        self.created.lock().unwrap().push((scope.to_string(), params.clone()));
        Ok(RoleAssignment {
            id: format!("{scope}/providers/Microsoft.Authorization/roleAssignments/{name}"),
            name: name.to_string(),
            resource_type: None,
            properties: RoleAssignmentProperties {
                scope: Some(scope.to_string()),
                role_definition_id: params.properties.role_definition_id.clone(),
                principal_id: params.properties.principal_id.clone(),
                principal_type: None,
            },
        })
    }

    async fn get(&self, _scope: &str, _name: &str) -> Result<Option<RoleAssignment>, ArmError> {
        Ok(None)
    }

    async fn delete_by_id(&self, _id: &str) -> Result<bool, ArmError> {
        Ok(false)
    }

    async fn list_by_scope(&self, _scope: &str) -> Result<Vec<RoleAssignment>, ArmError> {
        Ok(Vec::new())
    }

    async fn role_definition_by_scope_and_role_name(
        &self,
        scope: &str,
        role_name: &str,
    ) -> Result<Option<RoleDefinition>, ArmError> {
        Ok(Some(RoleDefinition {
            id: format!("{scope}/providers/Microsoft.Authorization/roleDefinitions/{role_name}"),
            name: role_name.to_string(),
            resource_type: None,
            properties: RoleDefinitionProperties {
                role_name: role_name.to_string(),
                description: None,
                role_type: Some("BuiltInRole".into()),
                assignable_scopes: vec!["/".into()],
            },
        }))
    }
}

fn identity_group(ids: &Arc<SharedIdProvider>, order: &Arc<AtomicUsize>) -> TaskGroup<String> {
    let (ids, order) = (Arc::clone(ids), Arc::clone(order));
    TaskGroup::new(
        "identity",
        FunctionalTaskItem::new(move |_ctx: InvocationContext| {
            let (ids, order) = (Arc::clone(&ids), Arc::clone(&order));
            async move {
                order.fetch_add(1, Ordering::SeqCst);
                ids.set("principal-1", IDENTITY_ID);
                Ok::<Option<String>, BoxError>(Some("principal-1".into()))
            }
        }),
    )
}

#[tokio::test]
async fn roles_are_granted_once_the_identity_exists() {
    let api = Arc::new(RecordingApi::default());
    let ids = Arc::new(SharedIdProvider::new());
    let order = Arc::new(AtomicUsize::new(0));

    let mut group = identity_group(&ids, &order);
    let helper = RoleAssignmentHelper::new(Arc::clone(&api) as Arc<dyn RoleAssignmentApi>, Arc::clone(&ids) as Arc<dyn IdProvider>);
    let rg_key = helper
        .with_access_to_current_resource_group(&mut group, BuiltInRole::Contributor)
        .unwrap();
    let lake_key = helper
        .with_access_to(&mut group, "/subscriptions/sub-1/resourceGroups/rg-data", BuiltInRole::Reader)
        .unwrap();

    let ctx = InvocationContext::new();
    let outcome = group.invoke(&ctx).await.unwrap();

    assert_eq!(outcome.root_result().map(String::as_str), Some("principal-1"));
    assert_eq!(order.load(Ordering::SeqCst), 1);
    assert!(ctx.has_key(&rg_key) && ctx.has_key(&lake_key));

    let mut scopes: Vec<String> = api.created.lock().unwrap().iter().map(|(s, _)| s.clone()).collect();
    scopes.sort();
    assert_eq!(
        scopes,
        vec![
            "/subscriptions/sub-1/resourceGroups/rg-app".to_string(),
            "/subscriptions/sub-1/resourceGroups/rg-data".to_string(),
        ]
    );
    assert!(
        api.created
            .lock()
            .unwrap()
            .iter()
            .all(|(_, p)| p.properties.principal_id == "principal-1")
    );
}

#[tokio::test]
async fn failing_identity_skips_its_grants() {
    let api = Arc::new(RecordingApi::default());
    let ids = Arc::new(SharedIdProvider::new());

    let mut group: TaskGroup<String> = TaskGroup::new(
        "identity",
        FunctionalTaskItem::new(|_ctx: InvocationContext| async {
            Err::<Option<String>, BoxError>("quota exceeded".into())
        }),
    );
    let helper = RoleAssignmentHelper::new(Arc::clone(&api) as Arc<dyn RoleAssignmentApi>, ids);
    helper.with_access_to(&mut group, "/subscriptions/sub-1", BuiltInRole::Reader).unwrap();

    let err = group.invoke(&InvocationContext::new()).await.unwrap_err();
    assert!(matches!(err, TaskGroupError::Failed(_)));
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].key, "identity");
    assert!(api.created.lock().unwrap().is_empty());
}
