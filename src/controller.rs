//! Control loop wiring.
//!
//! Builds the production collaborators from a [`ControllerConfig`] and runs
//! the kube-runtime `Controller` over GitOpsSets. Flux sources are watched
//! too, so a set waiting for an artifact is reconciled as soon as the
//! artifact appears.

use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::{HttpArtifactFetcher, KubeCluster, KubeEventRecorder};
use crate::config::ControllerConfig;
use crate::error::{GitOpsSetError, Result};
use crate::generators::{GeneratorDeps, GeneratorRegistry};
use crate::reconciler::Reconciler;
use crate::template::Renderer;

/// Name reported on events.
pub const CONTROLLER_NAME: &str = "gitopssets-controller";

/// Sources whose changes trigger the sets that reference them.
const WATCHED_SOURCES: &[(GeneratorKind, &str, &str)] = &[
    (GeneratorKind::GitRepository, "source.toolkit.fluxcd.io", "v1"),
    (GeneratorKind::OciRepository, "source.toolkit.fluxcd.io", "v1beta2"),
];

/// Shared state of the control loop.
struct Context {
    reconciler: Reconciler,
    requeue_on_error: Duration,
}

async fn reconcile(set: Arc<GitOpsSet>, ctx: Arc<Context>) -> std::result::Result<Action, GitOpsSetError> {
    let outcome = ctx
        .reconciler
        .reconcile(&set.namespace_or_default(), &set.name_any())
        .await?;
    debug!(set = %set.namespaced_name(), ?outcome, "Reconcile finished");
    Ok(outcome.requeue_after().map_or_else(Action::await_change, Action::requeue))
}

fn error_policy(set: Arc<GitOpsSet>, error: &GitOpsSetError, ctx: Arc<Context>) -> Action {
    let delay = error_delay(error, ctx.requeue_on_error);
    error!(set = %set.namespaced_name(), %error, retry_in = ?delay, "Reconciliation failed");
    Action::requeue(delay)
}

/// Retry delay for a failed reconcile.
fn error_delay(error: &GitOpsSetError, default: Duration) -> Duration {
    error.retry_delay_secs().map_or(default, Duration::from_secs)
}

/// Source names of `kind` referenced by a set, including inside a Matrix.
fn source_refs(set: &GitOpsSet, kind: GeneratorKind) -> Vec<&str> {
    let mut specs: Vec<GeneratorSpec<'_>> = Vec::new();
    for entry in &set.spec.generators {
        specs.extend(entry.specs());
        if let Some(matrix) = &entry.matrix {
            for nested in &matrix.generators {
                specs.extend(nested.specs());
            }
        }
    }
    specs
        .into_iter()
        .filter_map(|spec| match spec {
            GeneratorSpec::GitRepository(r) if kind == GeneratorKind::GitRepository => Some(r.repository_ref.as_str()),
            GeneratorSpec::OciRepository(r) if kind == GeneratorKind::OciRepository => Some(r.repository_ref.as_str()),
            _ => None,
        })
        .collect()
}

/// Sets in the source's namespace that reference it.
fn referencing_sets(
    sets: impl IntoIterator<Item = Arc<GitOpsSet>>,
    kind: GeneratorKind,
    namespace: &str,
    name: &str,
) -> Vec<ObjectRef<GitOpsSet>> {
    sets.into_iter()
        .filter(|set| set.namespace_or_default() == namespace && source_refs(set, kind).contains(&name))
        .map(|set| ObjectRef::from_obj(set.as_ref()))
        .collect()
}

/// Builds the reconciler from configuration and runs the control loop until
/// a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the cluster cannot be reached or the HTTP client
/// cannot be built.
pub async fn run(config: ControllerConfig) -> Result<()> {
    let cluster = KubeCluster::connect(&config.field_manager, config.scope_resolver()).await?;
    let client = cluster.client();
    let cluster = Arc::new(cluster);

    let deps = GeneratorDeps {
        reader: cluster.clone(),
        fetcher: Arc::new(HttpArtifactFetcher::new(config.http_timeout())?),
        http_timeout: config.http_timeout(),
    };
    let registry = GeneratorRegistry::builtin(&config.enabled_generators, &deps);
    let renderer = Renderer::new(cluster.clone()).with_functions(config.function_library());
    let events = Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME));
    let reconciler = Reconciler::new(cluster.clone(), cluster, events, registry.clone(), renderer)
        .with_default_service_account(config.default_service_account.clone());

    let sets: Api<GitOpsSet> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let ctx = Arc::new(Context {
        reconciler,
        requeue_on_error: config.requeue_on_error(),
    });

    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        generators = ?registry,
        "Starting GitOpsSet controller"
    );

    let mut controller = Controller::new(sets, WatcherConfig::default());
    let store = controller.store();
    for (kind, group, version) in WATCHED_SOURCES {
        if !registry.is_enabled(*kind) {
            continue;
        }
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind.as_str()));
        let sources: Api<DynamicObject> = match &config.watch_namespace {
            Some(namespace) => Api::namespaced_with(client.clone(), namespace, &resource),
            None => Api::all_with(client.clone(), &resource),
        };
        let store = store.clone();
        let kind = *kind;
        controller = controller.watches_with(sources, resource, WatcherConfig::default(), move |source| {
            referencing_sets(store.state(), kind, &source.namespace().unwrap_or_default(), &source.name_any())
        });
    }

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((set, action)) => debug!(set = %set.name, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Controller error"),
            }
        })
        .await;

    info!("GitOpsSet controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GitOpsSetSpec;
    use crate::error::{GeneratorError, StoreError};

    fn set(name: &str, namespace: &str, generators: &str) -> Arc<GitOpsSet> {
        let spec = GitOpsSetSpec {
            generators: serde_yaml::from_str(generators).expect("valid generators"),
            ..GitOpsSetSpec::default()
        };
        let mut set = GitOpsSet::new(name, spec);
        set.metadata.namespace = Some(namespace.to_string());
        Arc::new(set)
    }

    #[test]
    fn test_sources_map_to_referencing_sets() {
        let sets = vec![
            set("direct", "default", "- gitRepository:\n    repositoryRef: repo\n"),
            set(
                "nested",
                "default",
                "- matrix:\n    generators:\n      - gitRepository:\n          repositoryRef: repo\n",
            ),
            set("other-namespace", "team-a", "- gitRepository:\n    repositoryRef: repo\n"),
            set("oci", "default", "- ociRepository:\n    repositoryRef: repo\n"),
            set("list", "default", "- list:\n    elements: []\n"),
        ];

        let refs = referencing_sets(sets, GeneratorKind::GitRepository, "default", "repo");
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["direct", "nested"]);
    }

    #[test]
    fn test_error_delay() {
        let default = Duration::from_secs(30);
        let conflict: GitOpsSetError = StoreError::Conflict {
            namespace: String::from("default"),
            name: String::from("demo"),
            message: String::from("modified"),
        }
        .into();
        assert_eq!(error_delay(&conflict, default), Duration::from_secs(1));

        let disabled: GitOpsSetError = GeneratorError::NotEnabled {
            kind: GeneratorKind::Config,
        }
        .into();
        assert_eq!(error_delay(&disabled, default), default);
    }
}
