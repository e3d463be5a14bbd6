//! Kubernetes Events about the Ingresses handled by the controller.
//!
//! Publishing is fire-and-forget: failures are logged and never interrupt
//! a synchronization.

use alb_ingress_controller_apis::ObjectKey;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};

/// Reporting component of published Events.
pub const REPORTING_COMPONENT: &str = "aws-alb-ingress-controller";

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// Several load balancers carry the ownership tags of the same Ingress.
    pub const DUPLICATE_LOAD_BALANCER: &str = "DuplicateLoadBalancer";
    /// A load balancer tagged for the Ingress does not carry the name prefix.
    pub const FOREIGN_LOAD_BALANCER: &str = "ForeignLoadBalancer";
    /// Reconciling the Ingress failed.
    pub const SYNC_FAILED: &str = "SyncFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`.
pub mod actions {
    pub const ASSEMBLE: &str = "Assemble";
    pub const RECONCILE: &str = "Reconcile";
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by the kube-rs event [`Recorder`].
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTING_COMPONENT.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                "failed to publish {} event for {}/{}: {}",
                reason,
                reference.namespace.as_deref().unwrap_or_default(),
                reference.name.as_deref().unwrap_or_default(),
                e
            );
        }
    }
}

/// Discards all events.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _reference: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Reference to the Ingress identified by `key`.
pub fn ingress_reference(key: &ObjectKey) -> ObjectReference {
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: Some("Ingress".to_string()),
        namespace: key.namespace.clone(),
        name: Some(key.name.clone()),
        ..Default::default()
    }
}
