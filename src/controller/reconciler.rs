//! Core reconciliation logic for DeviceConfig resources
//!
//! A tick either walks the deletion path or runs the node-selector check,
//! ensures the finalizer and drives the sub-reconcilers in a fixed order.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    client::Client,
    core::PartialObjectMeta,
    runtime::{
        controller::{Action, Controller},
        metadata_watcher, predicates,
        reflector::ObjectRef,
        watcher::Config,
        WatchStreamExt,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::RetryBackoff;
use super::conditions::{ConditionsUpdater, KubeConditionsUpdater};
use super::events::{EventRecorder, KubeEventRecorder, EVENT_REASON_NODE_SELECTOR_CONFLICT};
use super::finalizers::{FinalizerUpdater, KubeFinalizerUpdater};
use super::mapper::device_configs_for_node;
use super::metrics::{self, Outcome};
use super::module::{KubeModuleReconciler, ModuleReconciler};
use super::node_labeler::{KubeNodeLabeler, NodeLabelerReconciler};
use super::node_metrics::{KubeNodeMetricsReconciler, NodeMetricsReconciler};
use super::node_selector::{KubeNodeSelectorValidator, NodeSelectorValidator};
use super::store::{DeviceConfigStore, KubeDeviceConfigStore};
use crate::config::Settings;
use crate::crd::{
    DeviceConfig, Module, REASON_MODULE_FAILED, REASON_NODE_LABELER_FAILED,
    REASON_NODE_METRICS_FAILED, REASON_NODE_SELECTOR_CONFLICT, REASON_READY_UPDATE_FAILED,
    REASON_RECONCILED,
};
use crate::error::{Error, Result};

/// Result of one tick. The reconciler never asks for a requeue itself;
/// retries come from the error policy and from watch events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue: bool,
}

/// Sub-reconcilers of the normal path, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Module,
    NodeLabeler,
    NodeMetrics,
}

impl Stage {
    const ORDER: [Stage; 3] = [Stage::Module, Stage::NodeLabeler, Stage::NodeMetrics];

    fn name(self) -> &'static str {
        match self {
            Stage::Module => "Module",
            Stage::NodeLabeler => "NodeLabeler",
            Stage::NodeMetrics => "NodeMetrics",
        }
    }

    /// Condition reason recorded when the stage fails
    fn failure_reason(self) -> &'static str {
        match self {
            Stage::Module => REASON_MODULE_FAILED,
            Stage::NodeLabeler => REASON_NODE_LABELER_FAILED,
            Stage::NodeMetrics => REASON_NODE_METRICS_FAILED,
        }
    }
}

/// Orchestrates the collaborators of a DeviceConfig tick
pub struct Reconciler {
    store: Arc<dyn DeviceConfigStore>,
    validator: Arc<dyn NodeSelectorValidator>,
    finalizers: Arc<dyn FinalizerUpdater>,
    module: Arc<dyn ModuleReconciler>,
    node_labeler: Arc<dyn NodeLabelerReconciler>,
    node_metrics: Arc<dyn NodeMetricsReconciler>,
    conditions: Arc<dyn ConditionsUpdater>,
    events: Arc<dyn EventRecorder>,
}

impl Reconciler {
    /// Reconciler backed by the API server
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        Self {
            store: Arc::new(KubeDeviceConfigStore::new(client.clone())),
            validator: Arc::new(KubeNodeSelectorValidator::new(client.clone())),
            finalizers: Arc::new(KubeFinalizerUpdater::new(client.clone())),
            module: Arc::new(KubeModuleReconciler::new(client.clone(), settings.clone())),
            node_labeler: Arc::new(KubeNodeLabeler::new(client.clone())),
            node_metrics: Arc::new(KubeNodeMetricsReconciler::new(client.clone(), settings)),
            conditions: Arc::new(KubeConditionsUpdater::new(client.clone())),
            events: Arc::new(KubeEventRecorder::new(client)),
        }
    }

    /// Reconcile the DeviceConfig named by `request`
    #[instrument(skip(self), fields(name = %request.name, namespace = request.namespace.as_deref()))]
    pub async fn reconcile_request(&self, request: &ObjectRef<DeviceConfig>) -> Result<ReconcileOutcome> {
        let namespace = request.namespace.as_deref().unwrap_or("default");

        let result = match self.store.get(namespace, &request.name).await {
            Ok(dc) if dc.is_being_deleted() => self.reconcile_deletion(&dc).await,
            Ok(dc) => self.reconcile_normal(&dc).await,
            Err(e) if e.is_not_found() => {
                debug!("DeviceConfig {}/{} not found, ignoring", namespace, request.name);
                return Ok(ReconcileOutcome::default());
            }
            Err(e) => Err(e),
        };

        if result.is_err() {
            metrics::record_reconcile(namespace, Outcome::Error);
        }
        result
    }

    async fn reconcile_normal(&self, dc: &DeviceConfig) -> Result<ReconcileOutcome> {
        info!("Reconciling DeviceConfig {}", dc.key());

        match self.validator.check_for_conflicts(dc).await {
            Ok(()) => {}
            Err(conflict @ Error::NodeSelectorConflict { .. }) => {
                return Ok(self.handle_conflict(dc, &conflict).await);
            }
            Err(e) => return Err(e),
        }

        if !self.finalizers.contains_deletion_finalizer(dc) {
            self.finalizers.add_deletion_finalizer(dc).await?;
        }

        for stage in Stage::ORDER {
            if let Err(e) = self.run_stage(stage, dc).await {
                return Err(self.handle_stage_failure(stage, dc, e).await);
            }
        }

        let message = format!(
            "Reconciled generation {}",
            dc.metadata.generation.unwrap_or_default()
        );
        if let Err(e) = self
            .conditions
            .set_conditions_ready(dc, REASON_RECONCILED, &message)
            .await
        {
            error!("Failed to set Ready condition on {}: {}", dc.key(), e);
            // A Ready left over from an earlier generation must not survive this tick
            if let Err(status_err) = self
                .conditions
                .set_conditions_errored(dc, REASON_READY_UPDATE_FAILED, &e.status_message())
                .await
            {
                error!("Failed to set Errored condition on {}: {}", dc.key(), status_err);
            }
            return Err(e);
        }

        metrics::record_reconcile(&dc.namespace_or_default(), Outcome::Success);
        info!("DeviceConfig {} reconciled", dc.key());
        Ok(ReconcileOutcome::default())
    }

    async fn run_stage(&self, stage: Stage, dc: &DeviceConfig) -> Result<()> {
        debug!("Running {} stage for {}", stage.name(), dc.key());
        match stage {
            Stage::Module => self.module.reconcile_module(dc).await,
            Stage::NodeLabeler => self.node_labeler.reconcile_node_labeler(dc).await,
            Stage::NodeMetrics => self.node_metrics.reconcile_node_metrics(dc).await,
        }
    }

    /// Record the failure on the DeviceConfig and wrap it with the stage name
    async fn handle_stage_failure(&self, stage: Stage, dc: &DeviceConfig, err: Error) -> Error {
        let reason = stage.failure_reason();
        error!("{} stage failed for {}: {}", stage.name(), dc.key(), err);
        metrics::record_stage_failure(&dc.namespace_or_default(), reason);

        if let Err(status_err) = self
            .conditions
            .set_conditions_errored(dc, reason, &err.status_message())
            .await
        {
            error!("Failed to set Errored condition on {}: {}", dc.key(), status_err);
        }

        Error::StageFailed {
            stage: stage.name(),
            source: Box::new(err),
        }
    }

    /// Surface a selector conflict without failing the tick
    async fn handle_conflict(&self, dc: &DeviceConfig, conflict: &Error) -> ReconcileOutcome {
        warn!("{}", conflict);

        if let Err(e) = self
            .events
            .warning(dc, EVENT_REASON_NODE_SELECTOR_CONFLICT, &conflict.to_string())
            .await
        {
            warn!("Failed to record conflict event for {}: {}", dc.key(), e);
        }

        if let Err(e) = self
            .conditions
            .set_conditions_errored(dc, REASON_NODE_SELECTOR_CONFLICT, &conflict.status_message())
            .await
        {
            error!("Failed to set Errored condition on {}: {}", dc.key(), e);
        }

        metrics::record_reconcile(&dc.namespace_or_default(), Outcome::Conflict);
        ReconcileOutcome::default()
    }

    /// Clean up the DeviceConfig's derived state, then release the finalizer
    async fn reconcile_deletion(&self, dc: &DeviceConfig) -> Result<ReconcileOutcome> {
        if !self.finalizers.contains_deletion_finalizer(dc) {
            debug!("DeviceConfig {} has no finalizer, nothing to clean up", dc.key());
            return Ok(ReconcileOutcome::default());
        }

        info!("Cleaning up DeviceConfig {}", dc.key());

        self.module
            .delete_module(dc)
            .await
            .map_err(|e| Error::CleanupFailed(Box::new(e)))?;

        // Node labels are not owned by the DeviceConfig and survive garbage collection
        self.node_labeler
            .remove_node_labels(dc)
            .await
            .map_err(|e| Error::CleanupFailed(Box::new(e)))?;

        self.finalizers.remove_deletion_finalizer(dc).await?;

        metrics::record_reconcile(&dc.namespace_or_default(), Outcome::Success);
        info!("Cleanup complete for DeviceConfig {}", dc.key());
        Ok(ReconcileOutcome::default())
    }
}

/// Shared state for the controller
pub struct ControllerState {
    client: Client,
    reconciler: Reconciler,
    backoff: RetryBackoff,
}

impl ControllerState {
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        Self {
            reconciler: Reconciler::new(client.clone(), settings),
            client,
            backoff: RetryBackoff::default(),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let device_configs: Api<DeviceConfig> = Api::all(client.clone());

    info!("Starting DeviceConfig controller");

    // Verify CRD exists
    match device_configs.list(&Default::default()).await {
        Ok(_) => info!("DeviceConfig CRD is available"),
        Err(e) => {
            error!(
                "DeviceConfig CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "DeviceConfig CRD not installed".to_string(),
            ));
        }
    }

    let controller = Controller::new(device_configs, Config::default());
    let store = controller.store();

    // Only label changes matter; status heartbeats are filtered out
    let node_changes = metadata_watcher(Api::<Node>::all(client.clone()), Config::default())
        .touched_objects()
        .predicate_filter(predicates::labels);

    controller
        // Watch owned resources for changes
        .owns::<Module>(Api::all(client.clone()), Config::default())
        .owns::<DaemonSet>(Api::all(client.clone()), Config::default())
        .watches_stream(node_changes, move |node: PartialObjectMeta<Node>| {
            device_configs_for_node(node.labels(), &store.state())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(obj: Arc<DeviceConfig>, ctx: Arc<ControllerState>) -> Result<Action> {
    let request = ObjectRef::from_obj(&*obj);
    let outcome = ctx.reconciler.reconcile_request(&request).await?;
    ctx.backoff.reset(&request);

    Ok(if outcome.requeue {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::await_change()
    })
}

/// Requeue a failed DeviceConfig with a delay growing on each consecutive failure
fn error_policy(dc: Arc<DeviceConfig>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    let delay = ctx
        .backoff
        .next_delay(&ObjectRef::from_obj(&*dc), error.is_retriable());
    error!(
        "Reconciliation error for {}, retrying in {:?}: {}",
        dc.name_any(),
        delay,
        error
    );

    Action::requeue(delay)
}
