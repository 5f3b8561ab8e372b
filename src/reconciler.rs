//! Reconciler for GitOpsSets.
//!
//! One call to [`Reconciler::reconcile`] takes a set from whatever state it
//! is in to its desired state: generate elements, render templates, diff the
//! result against the recorded inventory and apply the difference under the
//! set's service account. The outcome is recorded on the `Ready` condition
//! and as an event.

use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{Condition, ConditionStatus, FINALIZER, GitOpsSet, GitOpsSetStatus};
use crate::cluster::{ClientFactory, EventKind, EventRecorder, SetStore};
use crate::error::{GitOpsSetError, Result};
use crate::generators::GeneratorRegistry;
use crate::inventory::{ApplyExecutor, InventoryDiff, ResourceInventory, ResourceRef};
use crate::template::Renderer;

/// Reason set on success.
pub const REASON_SUCCEEDED: &str = "ReconciliationSucceeded";

/// Reason set on failure.
pub const REASON_FAILED: &str = "ReconciliationFailed";

/// Reason set while a source has no artifact yet.
pub const REASON_WAITING_FOR_ARTIFACT: &str = "WaitingForArtifact";

/// Message set while a source has no artifact yet.
pub const WAITING_FOR_ARTIFACT_MESSAGE: &str = "waiting for artifact";

/// How a reconcile ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The set does not exist.
    NotFound,
    /// The finalizer was added; the resulting update triggers the next reconcile.
    FinalizerAdded,
    /// Generated resources were deleted and the finalizer removed.
    Finalized {
        /// Number of resources deleted.
        deleted: usize,
    },
    /// The set is suspended; nothing was touched.
    Skipped,
    /// A source has no artifact yet.
    WaitingForArtifact,
    /// Every rendered resource was applied.
    Applied {
        /// Number of resources in the inventory.
        resources: usize,
        /// When to reconcile again, if a generator polls.
        requeue_after: Option<Duration>,
    },
}

impl ReconcileOutcome {
    /// When the host should reconcile again without a watch event.
    #[must_use]
    pub const fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Applied { requeue_after, .. } => *requeue_after,
            _ => None,
        }
    }
}

/// Reconciler for GitOpsSets.
#[derive(Clone)]
pub struct Reconciler {
    /// Reads sets and persists their status.
    store: Arc<dyn SetStore>,
    /// Builds clients impersonating the set's service account.
    clients: Arc<dyn ClientFactory>,
    /// Emits events on sets.
    events: Arc<dyn EventRecorder>,
    /// Enabled generators.
    registry: GeneratorRegistry,
    /// Template renderer.
    renderer: Renderer,
    /// Service account used when a set names none.
    default_service_account: Option<String>,
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn SetStore>,
        clients: Arc<dyn ClientFactory>,
        events: Arc<dyn EventRecorder>,
        registry: GeneratorRegistry,
        renderer: Renderer,
    ) -> Self {
        Self {
            store,
            clients,
            events,
            registry,
            renderer,
            default_service_account: None,
        }
    }

    /// Sets the service account impersonated for sets that name none.
    #[must_use]
    pub fn with_default_service_account(mut self, service_account: Option<String>) -> Self {
        self.default_service_account = service_account.filter(|sa| !sa.is_empty());
        self
    }

    /// Reconciles the set `namespace/name`.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the reconcile. It has already been
    /// recorded on the set's `Ready` condition when the set still exists.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(set) = self.store.get_set(namespace, name).await? else {
            debug!(set = %format!("{namespace}/{name}"), "GitOpsSet not found");
            return Ok(ReconcileOutcome::NotFound);
        };

        if set.is_being_deleted() {
            if !set.has_finalizer() {
                return Ok(ReconcileOutcome::NotFound);
            }
            return self.finalize(&set).await;
        }

        if !set.has_finalizer() {
            let mut finalizers = set.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.store.set_finalizers(&set, finalizers).await?;
            debug!(set = %set.namespaced_name(), "Added finalizer");
            return Ok(ReconcileOutcome::FinalizerAdded);
        }

        if set.spec.suspend {
            info!(set = %set.namespaced_name(), "GitOpsSet is suspended, skipping");
            return Ok(ReconcileOutcome::Skipped);
        }

        self.apply(&set).await
    }

    async fn apply(&self, set: &GitOpsSet) -> Result<ReconcileOutcome> {
        info!(set = %set.namespaced_name(), "Starting reconciliation");
        let generation = set.metadata.generation;
        let mut status = set.status.clone().unwrap_or_default();
        if let Some(requested) = set.pending_reconcile_request() {
            status.last_handled_reconcile_at = Some(requested.to_string());
        }

        let resources = match self.renderer.render_set(set, &self.registry).await {
            Ok(resources) => resources,
            Err(err) if err.is_not_ready() => {
                info!(set = %set.namespaced_name(), reason = %err, "Waiting for source artifact");
                status.set_ready(Condition::ready(
                    ConditionStatus::False,
                    REASON_WAITING_FOR_ARTIFACT,
                    WAITING_FOR_ARTIFACT_MESSAGE,
                    generation,
                ));
                self.store.update_status(set, &status).await?;
                return Ok(ReconcileOutcome::WaitingForArtifact);
            }
            Err(err) => return Err(self.fail(set, status, err).await),
        };

        let client = match self.clients.client_for(self.identity(set).as_deref()).await {
            Ok(client) => client,
            Err(err) => return Err(self.fail(set, status, err.into()).await),
        };

        let desired: Vec<ResourceRef> = resources.iter().map(|r| r.reference.clone()).collect();
        let previous = set.inventory();
        let diff = InventoryDiff::compute(previous, &desired);
        debug!(
            set = %set.namespaced_name(),
            creates = diff.creates,
            updates = diff.updates,
            deletes = diff.deletes,
            "Computed inventory diff"
        );

        let outcome = ApplyExecutor::new(client.as_ref())
            .with_owner(set.controller_owner_ref(&()))
            .execute(&diff, previous, &resources)
            .await;
        status.inventory = Some(outcome.inventory);
        if let Some(err) = outcome.error {
            return Err(self.fail(set, status, err.into()).await);
        }

        let count = status.inventory.as_ref().map_or(0, ResourceInventory::len);
        let message = format!("{count} resources created");
        status.observed_generation = generation;
        status.set_ready(Condition::ready(ConditionStatus::True, REASON_SUCCEEDED, &message, generation));
        self.store.update_status(set, &status).await?;
        self.events.publish(set, EventKind::Normal, REASON_SUCCEEDED, &message).await;

        info!(
            set = %set.namespaced_name(),
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "Reconciliation succeeded"
        );
        Ok(ReconcileOutcome::Applied {
            resources: count,
            requeue_after: self.registry.requeue_interval(set),
        })
    }

    /// Deletes every inventoried resource, then releases the finalizer.
    async fn finalize(&self, set: &GitOpsSet) -> Result<ReconcileOutcome> {
        info!(set = %set.namespaced_name(), "Deleting generated resources");
        let previous = set.inventory();
        let diff = InventoryDiff::compute(previous, &[]);

        if diff.deletes > 0 {
            let status = set.status.clone().unwrap_or_default();
            let client = match self.clients.client_for(self.identity(set).as_deref()).await {
                Ok(client) => client,
                Err(err) => return Err(self.fail(set, status, err.into()).await),
            };
            let outcome = ApplyExecutor::new(client.as_ref())
                .execute(&diff, previous, &[])
                .await;
            if let Some(err) = outcome.error {
                let status = GitOpsSetStatus {
                    inventory: Some(outcome.inventory),
                    ..status
                };
                return Err(self.fail(set, status, err.into()).await);
            }
        }

        let finalizers = set
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.store.set_finalizers(set, finalizers).await?;
        Ok(ReconcileOutcome::Finalized { deleted: diff.deletes })
    }

    /// Records `err` on the set and hands it back.
    async fn fail(&self, set: &GitOpsSet, mut status: GitOpsSetStatus, err: GitOpsSetError) -> GitOpsSetError {
        let message = err.to_string();
        warn!(set = %set.namespaced_name(), error = %message, "Reconciliation failed");
        status.set_ready(Condition::ready(
            ConditionStatus::False,
            REASON_FAILED,
            &message,
            set.metadata.generation,
        ));
        if let Err(store_err) = self.store.update_status(set, &status).await {
            warn!(set = %set.namespaced_name(), error = %store_err, "Failed to record failure");
        }
        self.events.publish(set, EventKind::Warning, REASON_FAILED, &message).await;
        err
    }

    /// The identity cluster writes are made as.
    fn identity(&self, set: &GitOpsSet) -> Option<String> {
        set.spec
            .service_account_name
            .as_deref()
            .filter(|sa| !sa.is_empty())
            .or(self.default_service_account.as_deref())
            .map(|sa| format!("system:serviceaccount:{}:{sa}", set.namespace_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GeneratorKind, GitOpsSetSpec, READY_CONDITION};
    use crate::cluster::{MemoryCluster, MockEventRecorder, WriteOp};
    use crate::error::StoreError;
    use crate::generators::InlineList;
    use serde_json::json;

    const NAMESPACE: &str = "default";

    fn spec(yaml: &str) -> GitOpsSetSpec {
        serde_yaml::from_str(yaml).expect("valid spec")
    }

    fn list_spec(envs: &[&str]) -> GitOpsSetSpec {
        let elements: Vec<_> = envs.iter().map(|env| json!({"env": env})).collect();
        let mut spec = spec(
            r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "{{ .Element.env }}-config"
"#,
        );
        spec.generators = serde_yaml::from_str(&format!("- list:\n    elements: {}\n", json!(elements)))
            .expect("valid generators");
        spec
    }

    fn seed(cluster: &MemoryCluster, spec: GitOpsSetSpec) {
        let mut set = GitOpsSet::new("demo", spec);
        set.metadata.namespace = Some(NAMESPACE.to_string());
        set.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cluster.insert_set(set);
    }

    fn reconciler(cluster: &MemoryCluster, events: MockEventRecorder) -> Reconciler {
        let registry = GeneratorRegistry::new()
            .register(GeneratorKind::List, Arc::new(InlineList))
            .with_matrix();
        Reconciler::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            Arc::new(events),
            registry,
            Renderer::new(Arc::new(cluster.clone())),
        )
    }

    fn quiet_events() -> MockEventRecorder {
        let mut events = MockEventRecorder::new();
        events.expect_publish().return_const(());
        events
    }

    fn ready(cluster: &MemoryCluster) -> Condition {
        cluster
            .set(NAMESPACE, "demo")
            .and_then(|s| s.ready_condition().cloned())
            .expect("ready condition")
    }

    #[tokio::test]
    async fn test_three_elements_three_resources() {
        let cluster = MemoryCluster::new();
        seed(&cluster, list_spec(&["dev", "staging", "prod"]));
        let mut events = MockEventRecorder::new();
        events
            .expect_publish()
            .withf(|_, kind, reason, message| {
                *kind == EventKind::Normal && reason == REASON_SUCCEEDED && message == "3 resources created"
            })
            .times(1)
            .return_const(());

        let outcome = reconciler(&cluster, events)
            .reconcile(NAMESPACE, "demo")
            .await
            .expect("reconciled");

        assert_eq!(outcome, ReconcileOutcome::Applied { resources: 3, requeue_after: None });
        let set = cluster.set(NAMESPACE, "demo").expect("set");
        assert_eq!(set.inventory().map(ResourceInventory::len), Some(3));
        let condition = ready(&cluster);
        assert_eq!(condition.type_, READY_CONDITION);
        assert!(condition.is_true());
        assert_eq!(condition.message, "3 resources created");
        assert_eq!(set.status.and_then(|s| s.observed_generation), Some(1));
        let stored = cluster
            .object("v1", "ConfigMap", NAMESPACE, "dev-config")
            .expect("created");
        assert_eq!(stored.pointer("/metadata/ownerReferences/0/kind"), Some(&json!("GitOpsSet")));
    }

    #[tokio::test]
    async fn test_finalizer_added_first() {
        let cluster = MemoryCluster::new();
        let mut set = GitOpsSet::new("demo", list_spec(&["dev"]));
        set.metadata.namespace = Some(NAMESPACE.to_string());
        cluster.insert_set(set);

        let outcome = reconciler(&cluster, MockEventRecorder::new())
            .reconcile(NAMESPACE, "demo")
            .await
            .expect("reconciled");
        assert_eq!(outcome, ReconcileOutcome::FinalizerAdded);
        assert!(cluster.set(NAMESPACE, "demo").is_some_and(|s| s.has_finalizer()));
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test]
    async fn test_missing_set_is_noop() {
        let cluster = MemoryCluster::new();
        let outcome = reconciler(&cluster, MockEventRecorder::new())
            .reconcile(NAMESPACE, "absent")
            .await
            .expect("reconciled");
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_suspended_set_untouched() {
        let cluster = MemoryCluster::new();
        let mut spec = list_spec(&["dev"]);
        spec.suspend = true;
        seed(&cluster, spec);

        let outcome = reconciler(&cluster, MockEventRecorder::new())
            .reconcile(NAMESPACE, "demo")
            .await
            .expect("reconciled");
        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert!(cluster.set(NAMESPACE, "demo").is_some_and(|s| s.status.is_none()));
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_partial_inventory() {
        let cluster = MemoryCluster::new();
        cluster
            .insert_object(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "prod-config", "namespace": NAMESPACE}
            }))
            .expect("seeded");
        seed(&cluster, list_spec(&["dev", "prod"]));
        let mut events = MockEventRecorder::new();
        events
            .expect_publish()
            .withf(|_, kind, _, message| *kind == EventKind::Warning && message.contains("already exists"))
            .times(1)
            .return_const(());

        let err = reconciler(&cluster, events)
            .reconcile(NAMESPACE, "demo")
            .await
            .expect_err("prod-config exists");

        assert_eq!(err.to_string(), "configmaps \"prod-config\" already exists");
        let condition = ready(&cluster);
        assert!(!condition.is_true());
        assert_eq!(condition.message, "configmaps \"prod-config\" already exists");
        let set = cluster.set(NAMESPACE, "demo").expect("set");
        let inventory = set.inventory().expect("inventory");
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.entries[0].name(), "dev-config");
    }

    #[tokio::test]
    async fn test_service_account_impersonated() {
        let cluster = MemoryCluster::new();
        let mut spec = list_spec(&["dev"]);
        spec.service_account_name = Some(String::from("deployer"));
        seed(&cluster, spec);

        reconciler(&cluster, quiet_events())
            .reconcile(NAMESPACE, "demo")
            .await
            .expect("reconciled");

        let identities: Vec<_> = cluster
            .writes()
            .iter()
            .filter_map(|w| match w {
                WriteOp::Create { identity, .. } => identity.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(identities, vec![String::from("system:serviceaccount:default:deployer")]);
    }

    #[tokio::test]
    async fn test_forbidden_identity_reported() {
        let cluster = MemoryCluster::new();
        cluster.forbid("system:serviceaccount:default:restricted");
        seed(&cluster, list_spec(&["dev"]));

        let err = reconciler(&cluster, quiet_events())
            .with_default_service_account(Some(String::from("restricted")))
            .reconcile(NAMESPACE, "demo")
            .await
            .expect_err("forbidden");
        assert!(err.to_string().contains("is forbidden"), "{err}");
        assert!(ready(&cluster).message.contains("cannot create resource \"configmaps\""));
    }

    #[tokio::test]
    async fn test_disabled_generator_fails_before_apply() {
        let cluster = MemoryCluster::new();
        let mut spec = list_spec(&["dev"]);
        spec.generators = serde_yaml::from_str("- config:\n    kind: ConfigMap\n    name: cm\n").expect("generators");
        seed(&cluster, spec);

        let err = reconciler(&cluster, quiet_events())
            .reconcile(NAMESPACE, "demo")
            .await
            .expect_err("config disabled");
        assert_eq!(err.to_string(), "generator Config not enabled");
        assert_eq!(ready(&cluster).message, "generator Config not enabled");
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_requested_at_recorded() {
        let cluster = MemoryCluster::new();
        let mut set = GitOpsSet::new("demo", list_spec(&["dev"]));
        set.metadata.namespace = Some(NAMESPACE.to_string());
        set.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        set.metadata.annotations = Some(
            [(
                crate::api::RECONCILE_REQUESTED_AT_ANNOTATION.to_string(),
                String::from("2024-05-01T10:00:00Z"),
            )]
            .into(),
        );
        cluster.insert_set(set);

        reconciler(&cluster, quiet_events())
            .reconcile(NAMESPACE, "demo")
            .await
            .expect("reconciled");
        let status = cluster.set(NAMESPACE, "demo").and_then(|s| s.status).expect("status");
        assert_eq!(status.last_handled_reconcile_at.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_deletion_removes_resources_and_finalizer() {
        let cluster = MemoryCluster::new();
        seed(&cluster, list_spec(&["dev", "prod"]));
        let reconciler = reconciler(&cluster, quiet_events());
        reconciler.reconcile(NAMESPACE, "demo").await.expect("applied");
        assert_eq!(cluster.objects().len(), 2);

        cluster.request_delete(NAMESPACE, "demo");
        let outcome = reconciler.reconcile(NAMESPACE, "demo").await.expect("finalized");

        assert_eq!(outcome, ReconcileOutcome::Finalized { deleted: 2 });
        assert!(cluster.objects().is_empty());
        assert!(cluster.set(NAMESPACE, "demo").is_none());
    }

    /// Serves sets from a `MemoryCluster` but rejects every status write
    /// as stale.
    struct StaleStatusStore(MemoryCluster);

    #[async_trait::async_trait]
    impl SetStore for StaleStatusStore {
        async fn get_set(&self, namespace: &str, name: &str) -> std::result::Result<Option<GitOpsSet>, StoreError> {
            self.0.get_set(namespace, name).await
        }

        async fn update_status(
            &self,
            set: &GitOpsSet,
            _status: &GitOpsSetStatus,
        ) -> std::result::Result<GitOpsSet, StoreError> {
            Err(StoreError::Conflict {
                namespace: set.namespace_or_default(),
                name: set.name_any(),
                message: String::from("the object has been modified"),
            })
        }

        async fn set_finalizers(
            &self,
            set: &GitOpsSet,
            finalizers: Vec<String>,
        ) -> std::result::Result<GitOpsSet, StoreError> {
            self.0.set_finalizers(set, finalizers).await
        }
    }

    #[tokio::test]
    async fn test_status_conflict_is_returned_without_event() {
        let cluster = MemoryCluster::new();
        seed(&cluster, list_spec(&["dev"]));
        let registry = GeneratorRegistry::new().register(GeneratorKind::List, Arc::new(InlineList));
        let reconciler = Reconciler::new(
            Arc::new(StaleStatusStore(cluster.clone())),
            Arc::new(cluster.clone()),
            Arc::new(MockEventRecorder::new()),
            registry,
            Renderer::new(Arc::new(cluster.clone())),
        );

        let err = reconciler
            .reconcile(NAMESPACE, "demo")
            .await
            .expect_err("status write rejected");

        assert!(matches!(err, GitOpsSetError::Store(StoreError::Conflict { .. })), "{err}");
        assert!(err.is_retryable());
        assert!(cluster.set(NAMESPACE, "demo").is_some_and(|s| s.status.is_none()));
    }

    #[test]
    fn test_requeue_after() {
        let outcome = ReconcileOutcome::Applied {
            resources: 1,
            requeue_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(outcome.requeue_after(), Some(Duration::from_secs(60)));
        assert_eq!(ReconcileOutcome::Skipped.requeue_after(), None);
    }
}
