use std::sync::Arc;

use alb_ingress_controller_apis::RunningConfiguration;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube_runtime::events::EventType;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::ControllerError,
    events::{EventPublisher, actions, ingress_reference, reasons},
    flowcontrol::SyncRateLimiter,
    provider::SharedRunningConfiguration,
    store::Storer,
    task::{Task, TaskHandler},
};

/// Drives cloud resources towards the desired state of the Ingresses.
///
/// Implementations must be idempotent: they are invoked once per queued
/// trigger and always receive the full set of Ingresses.
#[async_trait]
pub trait IngressReconciler: Send + Sync {
    async fn reconcile(
        &self,
        trigger: &Task,
        ingresses: &[Arc<Ingress>],
        running: &RunningConfiguration,
    ) -> Result<(), ControllerError>;
}

/// Handler of the ingress-sync queue.
pub struct IngressSync {
    store: Arc<dyn Storer>,
    reconciler: Arc<dyn IngressReconciler>,
    events: Arc<dyn EventPublisher>,
    running_config: SharedRunningConfiguration,
    rate_limiter: SyncRateLimiter,
    stop: CancellationToken,
}

impl IngressSync {
    pub fn new(
        store: Arc<dyn Storer>,
        reconciler: Arc<dyn IngressReconciler>,
        events: Arc<dyn EventPublisher>,
        running_config: SharedRunningConfiguration,
        sync_rate_limit: f64,
        stop: CancellationToken,
    ) -> Self {
        Self {
            store,
            reconciler,
            events,
            running_config,
            rate_limiter: SyncRateLimiter::new(sync_rate_limit),
            stop,
        }
    }
}

#[async_trait]
impl TaskHandler for IngressSync {
    async fn sync(&self, task: &Task) -> Result<(), ControllerError> {
        if !self.rate_limiter.until_ready(&self.stop).await {
            return Err(ControllerError::ShutdownInProgress);
        }
        let ingresses = self.store.list_ingresses();
        debug!(
            "Syncing {} Ingresses, triggered by {}",
            ingresses.len(),
            task
        );
        let result = {
            // Readers only: the running configuration is replaced by provider syncs.
            let running = self.running_config.read().await;
            self.reconciler.reconcile(task, &ingresses, &running).await
        };
        if let (Err(e), Task::Object(key)) = (&result, task) {
            self.events
                .publish(
                    &ingress_reference(key),
                    EventType::Warning,
                    reasons::SYNC_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
        }
        result
    }
}
