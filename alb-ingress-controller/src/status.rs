use std::sync::Arc;
use std::time::Duration;

use alb_ingress_controller_apis::{ObjectKey, RunningConfiguration};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, ResourceExt};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Configuration,
    errors::{ControllerError, ExtKubeApiError},
    provider::SharedRunningConfiguration,
    store::Storer,
    utils::{patch_status, status_patch},
};

/// Publishes the addresses of the running configuration to the Ingresses.
#[async_trait]
pub trait StatusSync: Send + Sync {
    /// Run until [`StatusSync::shutdown`] is called.
    async fn run(&self);

    fn shutdown(&self);
}

/// Election among the controller replicas.
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire or renew the lease, `true` while this replica holds it.
    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError>;
}

/// [`LeaderLease`] backed by a `coordination.k8s.io` Lease.
pub struct KubeLease {
    lock: LeaseLock,
}

impl KubeLease {
    pub fn new(client: Client, configuration: &Configuration) -> Self {
        let lock = LeaseLock::new(
            client,
            configuration.pod_namespace.as_str(),
            LeaseLockParams {
                holder_id: configuration.pod_name.clone(),
                lease_name: configuration.election_id.clone(),
                lease_ttl: configuration.lease_duration,
            },
        );
        Self { lock }
    }
}

#[async_trait]
impl LeaderLease for KubeLease {
    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let result = self
            .lock
            .try_acquire_or_renew()
            .await
            .map_err(anyhow::Error::new)?;
        if !result.acquired_lease {
            let holder = result
                .lease
                .as_ref()
                .and_then(|l| l.spec.as_ref())
                .and_then(|s| s.holder_identity.as_deref())
                .unwrap_or("unknown");
            trace!("status lease held by {}", holder);
        }
        Ok(result.acquired_lease)
    }
}

/// Writes status patches, returns `false` if the Ingress no longer exists.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn patch(
        &self,
        ingress: &Ingress,
        patch: json_patch::Patch,
    ) -> Result<bool, ControllerError>;
}

pub struct KubeStatusWriter {
    client: Client,
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch(
        &self,
        ingress: &Ingress,
        patch: json_patch::Patch,
    ) -> Result<bool, ControllerError> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace.as_str());
        patch_status(&api, ingress, patch).await
    }
}

/// [`StatusSync`] which writes load balancer hostnames into `Ingress.status`
/// while holding the election lease.
pub struct IngressStatusSyncer {
    writer: Arc<dyn StatusWriter>,
    lease: Arc<dyn LeaderLease>,
    store: Arc<dyn Storer>,
    running_config: SharedRunningConfiguration,
    update_interval: Duration,
    renew_interval: Duration,
    stop: CancellationToken,
}

impl IngressStatusSyncer {
    pub fn new(
        client: Client,
        configuration: &Configuration,
        store: Arc<dyn Storer>,
        running_config: SharedRunningConfiguration,
    ) -> Self {
        Self::with_parts(
            Arc::new(KubeStatusWriter {
                client: client.clone(),
            }),
            Arc::new(KubeLease::new(client, configuration)),
            store,
            running_config,
            configuration.status_update_interval,
            configuration.lease_duration / 3,
        )
    }

    pub(crate) fn with_parts(
        writer: Arc<dyn StatusWriter>,
        lease: Arc<dyn LeaderLease>,
        store: Arc<dyn Storer>,
        running_config: SharedRunningConfiguration,
        update_interval: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            writer,
            lease,
            store,
            running_config,
            update_interval,
            renew_interval,
            stop: CancellationToken::new(),
        }
    }

    /// Renew the lease, any error counts as not leading.
    async fn renew(&self, was_leader: bool) -> bool {
        let leader = match self.lease.try_acquire_or_renew().await {
            Ok(leader) => leader,
            Err(e) => {
                warn!("failed to renew status lease: {}", e);
                false
            }
        };
        match (was_leader, leader) {
            (false, true) => info!("acquired status lease, publishing Ingress status"),
            (true, false) => info!("lost status lease, no longer publishing Ingress status"),
            _ => {}
        }
        leader
    }

    async fn sync_status(&self) -> Result<usize, ControllerError> {
        let updates = {
            let running = self.running_config.read().await;
            status_updates(&self.store.list_ingresses(), &running)?
        };
        let mut updated = 0;
        for (ingress, patch) in updates {
            let namespace = ingress.namespace().unwrap_or_default();
            match self.writer.patch(&ingress, patch).await {
                Ok(true) => {
                    info!(
                        "updated load balancer status of Ingress {}/{}",
                        namespace,
                        ingress.name_any()
                    );
                    updated += 1;
                }
                Ok(false) => debug!(
                    "Ingress {}/{} no longer exists, skipping status update",
                    namespace,
                    ingress.name_any()
                ),
                Err(ControllerError::KubeApi(e)) if e.is_conflict() => debug!(
                    "conflict while updating status of Ingress {}/{}, retrying on next pass: {}",
                    namespace,
                    ingress.name_any(),
                    e
                ),
                Err(e) => warn!(
                    "failed to update status of Ingress {}/{}: {}",
                    namespace,
                    ingress.name_any(),
                    e
                ),
            }
        }
        Ok(updated)
    }
}

/// Status patches required to publish the hostnames of `running`.
fn status_updates(
    ingresses: &[Arc<Ingress>],
    running: &RunningConfiguration,
) -> Result<Vec<(Arc<Ingress>, json_patch::Patch)>, ControllerError> {
    let mut updates = Vec::new();
    for ingress in ingresses {
        let key = ObjectKey::from_resource(ingress.as_ref());
        let hostnames: Vec<String> = running
            .binding(&key)
            .and_then(|b| b.hostname())
            .map(|h| vec![h.to_string()])
            .unwrap_or_default();
        if let Some(patch) = status_patch(ingress, &hostnames)? {
            updates.push((ingress.clone(), patch));
        }
    }
    Ok(updates)
}

#[async_trait]
impl StatusSync for IngressStatusSyncer {
    async fn run(&self) {
        info!("starting status syncer");
        let mut renew = interval(self.renew_interval.max(Duration::from_millis(1)));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticker = interval(self.update_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leader = false;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = renew.tick() => leader = self.renew(leader).await,
                _ = ticker.tick(), if leader => {
                    if let Err(e) = self.sync_status().await {
                        warn!("status update failed: {}", e);
                    }
                }
            }
        }
        info!("status syncer stopped");
    }

    fn shutdown(&self) {
        self.stop.cancel();
    }
}
