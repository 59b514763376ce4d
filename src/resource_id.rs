//! ARM resource id parsing.
//!
//! Format:
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}(/{parentType}/{parentName})*/{type}/{name}`

use std::fmt;

use thiserror::Error;

/// Error returned for strings that are not ARM resource ids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("the specified id `{0}` is not a valid Azure resource id")]
pub struct InvalidResourceId(pub String);

/// A parsed ARM resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    id: String,
    subscription_id: String,
    resource_group_name: Option<String>,
    provider_namespace: Option<String>,
    resource_type: String,
    name: String,
    parent_id: Option<String>,
}

impl ResourceId {
    /// Parse a resource id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResourceId` if the fixed segments are missing or misspelled.
    pub fn parse(id: &str) -> Result<Self, InvalidResourceId> {
        let bad = || InvalidResourceId(id.to_string());
        let splits: Vec<&str> = id.strip_prefix('/').unwrap_or(id).split('/').collect();
        if splits.len() < 2 {
            return Err(bad());
        }

        let fixed = ["subscriptions", "resourceGroups", "providers"];
        for (i, expected) in fixed.iter().enumerate() {
            if let Some(seg) = splits.get(i * 2)
                && !seg.eq_ignore_ascii_case(expected)
            {
                return Err(bad());
            }
        }

        let subscription_id = splits[1].to_string();
        let resource_group_name = splits.get(3).map(|s| (*s).to_string());
        let provider_namespace = splits.get(5).map(|s| (*s).to_string());

        let mut parsed = Self {
            id: id.to_string(),
            subscription_id,
            resource_group_name,
            provider_namespace,
            resource_type: splits[splits.len() - 2].to_string(),
            name: splits[splits.len() - 1].to_string(),
            parent_id: (splits.len() >= 10).then(|| format!("/{}", splits[..splits.len() - 2].join("/"))),
        };

        if parsed
            .provider_namespace
            .as_deref()
            .is_some_and(|ns| ns.eq_ignore_ascii_case("microsoft.servicebus"))
        {
            parsed.apply_service_bus_layout(&splits);
        }

        Ok(parsed)
    }

    /// Queue and topic-subscription names may contain `/`, so everything after the
    /// type marker is the name.
    fn apply_service_bus_layout(&mut self, splits: &[&str]) {
        let last_index_of = |marker: &str| splits.iter().rposition(|s| *s == marker).filter(|i| *i > 0);

        let marker = last_index_of("queues").or_else(|| {
            last_index_of("topics").map(|topics| {
                last_index_of("subscriptions")
                    .filter(|subs| *subs > topics)
                    .unwrap_or(topics)
            })
        });

        if let Some(index) = marker
            && index + 1 < splits.len()
        {
            self.name = splits[index + 1..].join("/");
            self.parent_id = Some(format!("/{}", splits[..index].join("/")));
            self.resource_type = splits[index].to_string();
        }
    }

    /// The full id string.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscription id.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Resource group name, if the id is resource-group scoped.
    #[must_use]
    pub fn resource_group_name(&self) -> Option<&str> {
        self.resource_group_name.as_deref()
    }

    /// Provider namespace (e.g. `Microsoft.Compute`).
    #[must_use]
    pub fn provider_namespace(&self) -> Option<&str> {
        self.provider_namespace.as_deref()
    }

    /// Resource type without namespace or parent types.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent resource id, for nested resources.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.parent_id.as_deref().and_then(|p| Self::parse(p).ok())
    }

    /// Namespace-qualified type including parent types,
    /// e.g. `Microsoft.Network/virtualNetworks/subnets`.
    #[must_use]
    pub fn full_resource_type(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.full_resource_type(), self.resource_type),
            None => format!(
                "{}/{}",
                self.provider_namespace.as_deref().unwrap_or_default(),
                self.resource_type
            ),
        }
    }

    /// Id of the resource group that contains this resource.
    #[must_use]
    pub fn resource_group_id(&self) -> Option<String> {
        self.resource_group_name
            .as_deref()
            .map(|rg| format!("/subscriptions/{}/resourceGroups/{rg}", self.subscription_id))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Id of the resource group containing the resource `id`.
///
/// # Errors
///
/// Returns `InvalidResourceId` if `id` cannot be parsed or has no resource group.
pub fn resource_group_id(id: &str) -> Result<String, InvalidResourceId> {
    ResourceId::parse(id)?
        .resource_group_id()
        .ok_or_else(|| InvalidResourceId(id.to_string()))
}
