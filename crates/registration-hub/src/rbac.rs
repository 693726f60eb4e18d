//! RBAC and namespace materialization for accepted clusters
//!
//! An accepted spoke gets a dedicated namespace (named after the cluster), a
//! cluster role pair letting its agent operate on its own ManagedCluster, and
//! namespace-scoped roles for registration (leases, addon status) and work.
//! All objects are applied with server-side apply and removed on denial or
//! deletion.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

use registration_common::{Error, Result, SUBJECT_PREFIX};

const FIELD_MANAGER: &str = "registration-hub";

/// Name of the per-cluster ClusterRole and ClusterRoleBinding
pub fn cluster_role_name(cluster_name: &str) -> String {
    format!("open-cluster-management:managedcluster:{cluster_name}")
}

/// Name of the per-cluster registration Role and RoleBinding
pub fn registration_role_name(cluster_name: &str) -> String {
    format!("open-cluster-management:managedcluster:{cluster_name}:registration")
}

/// Name of the per-cluster work Role and RoleBinding
pub fn work_role_name(cluster_name: &str) -> String {
    format!("open-cluster-management:managedcluster:{cluster_name}:work")
}

/// The RBAC group carried by every certificate issued to this cluster
fn cluster_group(cluster_name: &str) -> String {
    format!("{SUBJECT_PREFIX}{cluster_name}")
}

fn group_subject(cluster_name: &str) -> Subject {
    Subject {
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        kind: "Group".to_string(),
        name: cluster_group(cluster_name),
        namespace: None,
    }
}

fn cluster_role(cluster_name: &str) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(cluster_role_name(cluster_name)),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["certificates.k8s.io".to_string()]),
                resources: Some(vec!["certificatesigningrequests".to_string()]),
                verbs: vec!["create".to_string(), "get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["cluster.open-cluster-management.io".to_string()]),
                resources: Some(vec!["managedclusters".to_string()]),
                resource_names: Some(vec![cluster_name.to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "update".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["cluster.open-cluster-management.io".to_string()]),
                resources: Some(vec!["managedclusters/status".to_string()]),
                resource_names: Some(vec![cluster_name.to_string()]),
                verbs: vec!["patch".to_string(), "update".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn cluster_role_binding(cluster_name: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(cluster_role_name(cluster_name)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role_name(cluster_name),
        },
        subjects: Some(vec![group_subject(cluster_name)]),
    }
}

fn registration_role(cluster_name: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(registration_role_name(cluster_name)),
            namespace: Some(cluster_name.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["coordination.k8s.io".to_string()]),
                resources: Some(vec!["leases".to_string()]),
                verbs: vec!["create".to_string(), "get".to_string(), "update".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["addon.open-cluster-management.io".to_string()]),
                resources: Some(vec!["managedclusteraddons".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["addon.open-cluster-management.io".to_string()]),
                resources: Some(vec!["managedclusteraddons/status".to_string()]),
                verbs: vec!["patch".to_string(), "update".to_string()],
                ..Default::default()
            },
        ]),
    }
}

fn work_role(cluster_name: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(work_role_name(cluster_name)),
            namespace: Some(cluster_name.to_string()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["work.open-cluster-management.io".to_string()]),
            resources: Some(vec!["manifestworks".to_string(), "manifestworks/status".to_string()]),
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "patch".to_string(),
            ],
            ..Default::default()
        }]),
    }
}

fn role_binding(cluster_name: &str, role_name: String) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            namespace: Some(cluster_name.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name,
        },
        subjects: Some(vec![group_subject(cluster_name)]),
    }
}

fn cluster_namespace(cluster_name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(cluster_name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn apply<K>(client: &Client, obj: &K) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&obj.name_any(), &params, &Patch::Apply(obj))
        .await
        .map_err(|source| Error::Kube { source })?;
    Ok(())
}

async fn apply_namespaced<K>(client: &Client, namespace: &str, obj: &K) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&obj.name_any(), &params, &Patch::Apply(obj))
        .await
        .map_err(|source| Error::Kube { source })?;
    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + std::fmt::Debug + serde::de::DeserializeOwned + 'static,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(source) => Err(Error::Kube { source }),
    }
}

/// Apply the namespace and all RBAC objects for an accepted cluster
pub async fn apply_cluster_resources(client: &Client, cluster_name: &str) -> Result<()> {
    apply(client, &cluster_namespace(cluster_name)).await?;
    apply(client, &cluster_role(cluster_name)).await?;
    apply(client, &cluster_role_binding(cluster_name)).await?;
    apply_namespaced(client, cluster_name, &registration_role(cluster_name)).await?;
    apply_namespaced(
        client,
        cluster_name,
        &role_binding(cluster_name, registration_role_name(cluster_name)),
    )
    .await?;
    apply_namespaced(client, cluster_name, &work_role(cluster_name)).await?;
    apply_namespaced(
        client,
        cluster_name,
        &role_binding(cluster_name, work_role_name(cluster_name)),
    )
    .await?;
    Ok(())
}

/// Remove the RBAC objects for a cluster. The namespace is left alone: on
/// denial it may still hold user data, and on deletion the deletion
/// controller removes it in its own phase.
pub async fn remove_cluster_resources(client: &Client, cluster_name: &str) -> Result<()> {
    let cluster_roles: Api<ClusterRole> = Api::all(client.clone());
    let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    let roles: Api<Role> = Api::namespaced(client.clone(), cluster_name);
    let role_bindings: Api<RoleBinding> = Api::namespaced(client.clone(), cluster_name);

    delete_ignoring_missing(&cluster_role_bindings, &cluster_role_name(cluster_name)).await?;
    delete_ignoring_missing(&cluster_roles, &cluster_role_name(cluster_name)).await?;
    delete_ignoring_missing(&role_bindings, &registration_role_name(cluster_name)).await?;
    delete_ignoring_missing(&roles, &registration_role_name(cluster_name)).await?;
    delete_ignoring_missing(&role_bindings, &work_role_name(cluster_name)).await?;
    delete_ignoring_missing(&roles, &work_role_name(cluster_name)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_embed_cluster() {
        assert_eq!(
            cluster_role_name("cluster1"),
            "open-cluster-management:managedcluster:cluster1"
        );
        assert_eq!(
            registration_role_name("cluster1"),
            "open-cluster-management:managedcluster:cluster1:registration"
        );
        assert_eq!(
            work_role_name("cluster1"),
            "open-cluster-management:managedcluster:cluster1:work"
        );
    }

    #[test]
    fn bindings_grant_to_the_cluster_group() {
        let binding = cluster_role_binding("cluster1");
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "Group");
        assert_eq!(subjects[0].name, "open-cluster-management:cluster1");
    }

    #[test]
    fn cluster_role_is_scoped_to_own_cluster() {
        let role = cluster_role("cluster1");
        let rules = role.rules.unwrap();
        let cluster_rule = rules
            .iter()
            .find(|r| {
                r.resources
                    .as_ref()
                    .is_some_and(|res| res.contains(&"managedclusters".to_string()))
            })
            .expect("managedclusters rule present");
        assert_eq!(
            cluster_rule.resource_names,
            Some(vec!["cluster1".to_string()])
        );
    }

    #[test]
    fn registration_role_grants_lease_and_addon_status_access() {
        let role = registration_role("cluster1");
        assert_eq!(role.metadata.namespace.as_deref(), Some("cluster1"));
        let rules = role.rules.unwrap();
        assert!(rules.iter().any(|r| {
            r.api_groups
                .as_ref()
                .is_some_and(|g| g.contains(&"coordination.k8s.io".to_string()))
        }));
        assert!(rules.iter().any(|r| {
            r.resources
                .as_ref()
                .is_some_and(|res| res.contains(&"managedclusteraddons/status".to_string()))
        }));
    }

    #[test]
    fn work_role_allows_manifestwork_updates() {
        let role = work_role("cluster1");
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].verbs.contains(&"update".to_string()));
    }
}
