//! Kubernetes API seam for the controllers
//!
//! Reconcilers never touch `kube::Api` directly. Every read and write they
//! issue goes through [`OperatorApi`], so a pass can be driven against an
//! in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, ObjectReference, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{MySQLBackup, MySQLBackupStatus, MySQLCluster, MySQLClusterStatus};
use crate::resources::common::{FIELD_MANAGER, member_selector};

/// A child object the cluster reconciler creates or updates
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    Secret(Secret),
    ConfigMap(ConfigMap),
    Service(Service),
    PodDisruptionBudget(PodDisruptionBudget),
    StatefulSet(StatefulSet),
}

impl ManagedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ManagedObject::Secret(_) => "Secret",
            ManagedObject::ConfigMap(_) => "ConfigMap",
            ManagedObject::Service(_) => "Service",
            ManagedObject::PodDisruptionBudget(_) => "PodDisruptionBudget",
            ManagedObject::StatefulSet(_) => "StatefulSet",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ManagedObject::Secret(o) => o.name_any(),
            ManagedObject::ConfigMap(o) => o.name_any(),
            ManagedObject::Service(o) => o.name_any(),
            ManagedObject::PodDisruptionBudget(o) => o.name_any(),
            ManagedObject::StatefulSet(o) => o.name_any(),
        }
    }
}

/// Severity of an emitted event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// A Kubernetes Event to publish against an operator resource
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub severity: EventSeverity,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl EventRecord {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

/// Reads and writes issued by the reconcilers
///
/// Reads of single objects return `Ok(None)` on 404. Creates treat 409
/// AlreadyExists as success and deletes treat 404 as success, so every
/// operation is safe to repeat.
#[async_trait]
pub trait OperatorApi: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<MySQLCluster>>;

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_pdb(&self, namespace: &str, name: &str) -> Result<Option<PodDisruptionBudget>>;

    /// Member pods of a cluster, in any order
    async fn list_member_pods(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Pod>>;

    /// Data volume claims created from the StatefulSet claim template
    async fn list_data_volumes(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Server-side apply a managed object
    async fn apply(&self, namespace: &str, object: &ManagedObject) -> Result<()>;

    /// Set a single label on a pod
    async fn label_pod(&self, namespace: &str, pod: &str, key: &str, value: &str) -> Result<()>;

    /// Run a command in a pod container and return its stdout
    ///
    /// A command that runs but exits unsuccessfully yields `Error::ExecError`.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String>;

    /// Merge-patch the cluster status, conditional on `resource_version`
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MySQLClusterStatus,
    ) -> Result<()>;

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<MySQLBackup>>;

    /// Backups matching a label selector
    async fn list_backups(&self, namespace: &str, label_selector: &str) -> Result<Vec<MySQLBackup>>;

    async fn create_backup(&self, namespace: &str, backup: &MySQLBackup) -> Result<()>;

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Merge-patch the backup status, conditional on `resource_version`
    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MySQLBackupStatus,
    ) -> Result<()>;

    /// Publish an event; failures are logged, never returned
    async fn publish_event(&self, reference: &ObjectReference, event: EventRecord);
}

/// [`OperatorApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeOperatorApi {
    client: Client,
    reporter: Reporter,
}

impl KubeOperatorApi {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance,
            },
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn server_side_apply<K>(&self, namespace: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let name = object.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;
        self.api::<K>(namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            )
            .await?;
        Ok(())
    }

    async fn create_if_absent<K>(&self, namespace: &str, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        match self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = ?object.meta().name, "Object already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status_with_precondition<K, S>(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &S,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        S: Serialize + Sync,
    {
        let mut patch = json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OperatorApi for KubeOperatorApi {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<MySQLCluster>> {
        self.get_opt(namespace, name).await
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get_opt(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_opt(namespace, name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get_opt(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(namespace, name).await
    }

    async fn get_pdb(&self, namespace: &str, name: &str) -> Result<Option<PodDisruptionBudget>> {
        self.get_opt(namespace, name).await
    }

    async fn list_member_pods(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Pod>> {
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(&member_selector(cluster_name)))
            .await?;
        Ok(pods.items)
    }

    async fn list_data_volumes(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let claims = self
            .api::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(&member_selector(cluster_name)))
            .await?;
        Ok(claims.items)
    }

    async fn apply(&self, namespace: &str, object: &ManagedObject) -> Result<()> {
        match object {
            ManagedObject::Secret(o) => self.server_side_apply(namespace, o).await,
            ManagedObject::ConfigMap(o) => self.server_side_apply(namespace, o).await,
            ManagedObject::Service(o) => self.server_side_apply(namespace, o).await,
            ManagedObject::PodDisruptionBudget(o) => self.server_side_apply(namespace, o).await,
            ManagedObject::StatefulSet(o) => self.server_side_apply(namespace, o).await,
        }
    }

    async fn label_pod(&self, namespace: &str, pod: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "metadata": { "labels": { key: value } } });
        self.api::<Pod>(namespace)
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            stdin: false,
            stdout: true,
            stderr: false,
            tty: false,
            ..Default::default()
        };

        let mut attached = self
            .api::<Pod>(namespace)
            .exec(pod, command, &attach_params)
            .await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::ExecError("No stdout available".to_string()))?;

        let mut output = Vec::new();
        stdout_reader
            .read_to_end(&mut output)
            .await
            .map_err(|e| Error::ExecError(format!("Failed to read stdout: {}", e)))?;

        if let Some(status_channel) = attached.take_status()
            && let Some(result) = status_channel.await
            && let Some(status) = result.status
            && status != "Success"
        {
            debug!(pod = pod, status = status, "Command exited with non-success status");
            return Err(Error::ExecError(
                result.message.unwrap_or_else(|| format!("command exited with {}", status)),
            ));
        }

        String::from_utf8(output)
            .map_err(|e| Error::ExecError(format!("Command output is not UTF-8: {}", e)))
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MySQLClusterStatus,
    ) -> Result<()> {
        self.patch_status_with_precondition::<MySQLCluster, _>(
            namespace,
            name,
            resource_version,
            status,
        )
        .await
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<MySQLBackup>> {
        self.get_opt(namespace, name).await
    }

    async fn list_backups(&self, namespace: &str, label_selector: &str) -> Result<Vec<MySQLBackup>> {
        let backups = self
            .api::<MySQLBackup>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(backups.items)
    }

    async fn create_backup(&self, namespace: &str, backup: &MySQLBackup) -> Result<()> {
        self.create_if_absent(namespace, backup).await
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<MySQLBackup>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get_opt(namespace, name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        self.create_if_absent(namespace, job).await
    }

    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &MySQLBackupStatus,
    ) -> Result<()> {
        self.patch_status_with_precondition::<MySQLBackup, _>(
            namespace,
            name,
            resource_version,
            status,
        )
        .await
    }

    async fn publish_event(&self, reference: &ObjectReference, event: EventRecord) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note,
                    action: event.action,
                    secondary: None,
                },
                reference,
            )
            .await
        {
            tracing::warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
