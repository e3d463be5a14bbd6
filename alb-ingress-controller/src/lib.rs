//! Kubernetes Ingress controller core for AWS Application Load Balancers.
//!
//! The [`AlbController`] keeps a running picture of the load balancers owned
//! by the cluster, coalesces Ingress and ConfigMap change events into two
//! deduplicating work queues and publishes load balancer addresses back into
//! `Ingress.status`. Cloud access and the translation of Ingresses into load
//! balancer configuration are plugged in through [`ResourceTagging`] and
//! [`IngressReconciler`].

#[macro_use]
extern crate log;

pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod flowcontrol;
pub mod ingress;
pub mod prometheus_exporter;
pub mod provider;
pub mod ring;
pub mod status;
pub mod store;
pub mod task;
mod utils;

pub use config::{Configuration, generate_name_prefix};
pub use controller::{AlbController, ControllerContext, ControllerState};
pub use errors::ControllerError;
pub use events::EventPublisher;
pub use ingress::IngressReconciler;
pub use provider::{IngressAssembler, ResourceTagging, SharedRunningConfiguration, TagAssembler};
pub use prometheus_exporter::serve_metrics;
pub use status::{LeaderLease, StatusSync};
pub use store::{Event, EventType, Storer};
pub use task::{RetryPolicy, Task};

/// The K8s field manager name.
const MANAGER: &str = "alb-ingress-controller";

const SUCCESS: &str = "success";
const FAILURE: &str = "failure";

/// Install the ring rustls provider used by the kube client, once per process.
pub fn install_crypto_provider() {
    // Fails if a provider was installed before, which is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Kubernetes client from the local kubeconfig or the in-cluster service account.
pub async fn kube_client() -> Result<kube::Client, ControllerError> {
    install_crypto_provider();
    Ok(kube::Client::try_default().await?)
}
