use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use alb_ingress_controller_apis::{
    ClusterResources, IngressBinding, ObjectKey, RunningConfiguration, TaggedResource,
};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use kube_runtime::events::EventType;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use tokio::sync::RwLock;

use crate::{
    config::Configuration,
    errors::ControllerError,
    events::{EventPublisher, actions, ingress_reference, reasons},
    store::Storer,
    task::{Task, TaskHandler},
    utils::metric_name,
};

const PROVIDER_SYNC: &str = "provider_sync";

/// The running configuration shared by the synchronizer, the ingress
/// reconciler and the status syncer.
pub type SharedRunningConfiguration = Arc<RwLock<RunningConfiguration>>;

/// The cloud resource tagging service.
#[async_trait]
pub trait ResourceTagging: Send + Sync {
    /// All load balancers, target groups, listeners, rules and subnets
    /// carrying this cluster's ownership tag.
    async fn cluster_resources(&self) -> Result<ClusterResources, ControllerError>;
}

pub struct AssembleOptions<'a> {
    pub alb_name_prefix: &'a str,
    pub cluster_name: &'a str,
}

/// Something about an Ingress's cloud resources that needs attention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Anomaly {
    pub ingress: ObjectKey,
    pub reason: &'static str,
    pub note: String,
}

/// Outcome of an [`IngressAssembler`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assembly {
    pub bindings: Vec<IngressBinding>,
    pub anomalies: Vec<Anomaly>,
}

/// Rebuilds Ingress bindings from the tagged cloud inventory.
pub trait IngressAssembler: Send + Sync {
    fn assemble(
        &self,
        resources: &ClusterResources,
        ingresses: &[Arc<Ingress>],
        options: &AssembleOptions<'_>,
    ) -> Assembly;
}

/// Matches load balancers to Ingresses through their ownership tags.
///
/// Target groups are matched by the same tags, listeners and rules by ARN
/// ancestry (`...:listener/app/{lb}/{lb-id}/{id}` belongs to
/// `...:loadbalancer/app/{lb}/{lb-id}`).
#[derive(Default)]
pub struct TagAssembler;

impl TagAssembler {
    fn belongs_to(child: &TaggedResource, load_balancer_arn: &str, child_type: &str) -> bool {
        let parent = load_balancer_arn.replacen(":loadbalancer/", format!(":{}/", child_type).as_str(), 1);
        parent != load_balancer_arn && child.arn.starts_with(format!("{}/", parent).as_str())
    }
}

impl IngressAssembler for TagAssembler {
    fn assemble(
        &self,
        resources: &ClusterResources,
        ingresses: &[Arc<Ingress>],
        options: &AssembleOptions<'_>,
    ) -> Assembly {
        let known: HashSet<(String, String)> = ingresses
            .iter()
            .map(|i| (i.namespace().unwrap_or_default(), i.name_any()))
            .collect();
        let mut load_balancers: Vec<_> = resources
            .load_balancers
            .iter()
            .filter(|lb| lb.resource.is_owned_by_cluster(options.cluster_name))
            .collect();
        load_balancers.sort_by(|a, b| a.resource.arn.cmp(&b.resource.arn));
        let mut assembly = Assembly::default();
        let mut bound: HashSet<ObjectKey> = HashSet::new();
        for lb in load_balancers {
            let Some((namespace, name)) = lb.resource.ingress_owner() else {
                debug!("load balancer {} is not tagged with an Ingress", lb.resource.arn);
                continue;
            };
            if !known.contains(&(namespace.to_string(), name.to_string())) {
                debug!(
                    "load balancer {} belongs to Ingress {}/{} which is not in the store",
                    lb.resource.arn, namespace, name
                );
                continue;
            }
            let ingress = ObjectKey::new("Ingress", Some(namespace), name);
            if !lb
                .name()
                .is_some_and(|name| name.starts_with(options.alb_name_prefix))
            {
                debug!(
                    "ignoring load balancer {} without name prefix {}",
                    lb.resource.arn, options.alb_name_prefix
                );
                assembly.anomalies.push(Anomaly {
                    ingress,
                    reason: reasons::FOREIGN_LOAD_BALANCER,
                    note: format!(
                        "load balancer {} is tagged for this Ingress but its name lacks the prefix {}",
                        lb.resource.arn, options.alb_name_prefix
                    ),
                });
                continue;
            }
            if !bound.insert(ingress.clone()) {
                assembly.anomalies.push(Anomaly {
                    ingress,
                    reason: reasons::DUPLICATE_LOAD_BALANCER,
                    note: format!(
                        "load balancer {} is ignored, the Ingress already has a load balancer",
                        lb.resource.arn
                    ),
                });
                continue;
            }
            let lb_arn = lb.resource.arn.as_str();
            assembly.bindings.push(IngressBinding {
                ingress,
                load_balancer: lb.clone(),
                target_groups: resources
                    .target_groups
                    .iter()
                    .filter(|tg| tg.ingress_owner() == Some((namespace, name)))
                    .cloned()
                    .collect(),
                listeners: resources
                    .listeners
                    .iter()
                    .filter(|l| Self::belongs_to(l, lb_arn, "listener"))
                    .cloned()
                    .collect(),
                listener_rules: resources
                    .listener_rules
                    .iter()
                    .filter(|r| Self::belongs_to(r, lb_arn, "listener-rule"))
                    .cloned()
                    .collect(),
            });
        }
        assembly.bindings.sort_by(|a, b| a.ingress.cmp(&b.ingress));
        assembly
    }
}

/// Re-derives the [`RunningConfiguration`] from the cloud inventory.
pub struct ProviderSync {
    cluster_name: String,
    alb_name_prefix: String,
    store: Arc<dyn Storer>,
    tagging: Arc<dyn ResourceTagging>,
    assembler: Arc<dyn IngressAssembler>,
    events: Arc<dyn EventPublisher>,
    running_config: SharedRunningConfiguration,
    sync_count: Counter<u64>,
    sync_duration: Histogram<u64>,
}

impl ProviderSync {
    pub fn new(
        configuration: &Configuration,
        store: Arc<dyn Storer>,
        tagging: Arc<dyn ResourceTagging>,
        assembler: Arc<dyn IngressAssembler>,
        events: Arc<dyn EventPublisher>,
        running_config: SharedRunningConfiguration,
    ) -> Self {
        let meter: Meter = global::meter(PROVIDER_SYNC);
        let sync_count = meter
            .u64_counter(metric_name("provider_sync_count"))
            .with_description("Count of cloud inventory synchronizations")
            .build();
        let sync_duration = meter
            .u64_histogram(metric_name("provider_sync_duration_ms"))
            .with_description("Cloud inventory synchronization duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            cluster_name: configuration.cluster_name.clone(),
            alb_name_prefix: configuration.alb_name_prefix.clone(),
            store,
            tagging,
            assembler,
            events,
            running_config,
            sync_count,
            sync_duration,
        }
    }

    /// Query the tagging service and rebuild the running configuration.
    ///
    /// The write lock is held for the whole pass, so concurrent callers are
    /// serialized and readers never observe a half-built configuration. On
    /// error the previous configuration is left untouched. Anomalies found
    /// while assembling are published as Warning events once the lock is
    /// released.
    pub async fn synchronize(&self) -> Result<(), ControllerError> {
        let anomalies = self.rebuild().await?;
        for anomaly in anomalies {
            warn!("Ingress {}: {}", anomaly.ingress, anomaly.note);
            self.events
                .publish(
                    &ingress_reference(&anomaly.ingress),
                    EventType::Warning,
                    anomaly.reason,
                    actions::ASSEMBLE,
                    Some(anomaly.note),
                )
                .await;
        }
        Ok(())
    }

    async fn rebuild(&self) -> Result<Vec<Anomaly>, ControllerError> {
        let mut running = self.running_config.write().await;
        let start = Instant::now();
        debug!("Synchronizing cloud resources");
        let resources = match self.tagging.cluster_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                self.sync_count
                    .add(1, &[KeyValue::new("result", crate::FAILURE)]);
                return Err(e);
            }
        };
        debug!(
            "Retrieved tag information on {} load balancers, {} target groups, {} listeners, {} rules, and {} subnets.",
            resources.load_balancers.len(),
            resources.target_groups.len(),
            resources.listeners.len(),
            resources.listener_rules.len(),
            resources.subnets.len()
        );
        let ingresses = self.store.list_ingresses();
        let assembly = self.assembler.assemble(
            &resources,
            &ingresses,
            &AssembleOptions {
                alb_name_prefix: self.alb_name_prefix.as_str(),
                cluster_name: self.cluster_name.as_str(),
            },
        );
        running.ingresses = assembly.bindings;
        debug!(
            "Running configuration holds {} Ingress bindings",
            running.ingresses.len()
        );
        self.sync_count
            .add(1, &[KeyValue::new("result", crate::SUCCESS)]);
        self.sync_duration
            .record(start.elapsed().as_millis() as u64, &[]);
        Ok(assembly.anomalies)
    }
}

#[async_trait]
impl TaskHandler for ProviderSync {
    async fn sync(&self, _task: &Task) -> Result<(), ControllerError> {
        self.synchronize().await
    }
}
