use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::ControllerError;
use crate::task::RetryPolicy;

/// Ingress reconciliation cadence, not configurable.
pub const INGRESS_SYNC_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_SYNC_RATE_LIMIT: f64 = 0.3;
const DEFAULT_PROVIDER_SYNC_PERIOD: Duration = Duration::from_secs(3600);
const DEFAULT_STATUS_UPDATE_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_ELECTION_ID: &str = "ingress-controller-leader-alb";
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_POD_NAMESPACE: &str = "kube-system";

/// Controller configuration, immutable once the controller has been created.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Identifies the cluster in the cloud ownership tags.
    pub cluster_name: String,
    /// Prefix for all load balancer names created by this controller.
    pub alb_name_prefix: String,
    /// Only watch Ingresses in this namespace, `None` means all namespaces.
    pub watch_namespace: Option<String>,
    /// The `(namespace, name)` of the ConfigMap holding controller settings.
    pub config_map: Option<(String, String)>,
    /// Maximum number of full ingress synchronizations per second.
    pub sync_rate_limit: f64,
    /// How often the cloud inventory is re-derived.
    pub provider_sync_interval: Duration,
    /// Name of the Lease electing the replica which publishes Ingress status.
    pub election_id: String,
    /// Holder identity in the election Lease.
    pub pod_name: String,
    /// Namespace of the election Lease.
    pub pod_namespace: String,
    pub lease_duration: Duration,
    pub retry_policy: RetryPolicy,
    pub status_update_interval: Duration,
    pub metrics_addr: SocketAddr,
}

impl Configuration {
    /// Configuration with defaults for everything but the cluster name.
    pub fn new(cluster_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            alb_name_prefix: generate_name_prefix(cluster_name),
            watch_namespace: None,
            config_map: None,
            sync_rate_limit: DEFAULT_SYNC_RATE_LIMIT,
            provider_sync_interval: DEFAULT_PROVIDER_SYNC_PERIOD,
            election_id: DEFAULT_ELECTION_ID.to_string(),
            pod_name: format!("{}-{}", crate::MANAGER, std::process::id()),
            pod_namespace: DEFAULT_POD_NAMESPACE.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            retry_policy: RetryPolicy::default(),
            status_update_interval: DEFAULT_STATUS_UPDATE_PERIOD,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }

    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cluster_name = lookup("CLUSTER_NAME").ok_or_else(|| {
            ControllerError::Configuration("CLUSTER_NAME must be set".to_string())
        })?;
        let mut configuration = Configuration::new(cluster_name.as_str());
        if let Some(prefix) = lookup("ALB_NAME_PREFIX") {
            configuration.alb_name_prefix = prefix;
        }
        info!(
            "ALB resource names will be prefixed with {}",
            configuration.alb_name_prefix
        );
        configuration.watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| ns != "*");
        if let Some(cm) = lookup("CONFIG_MAP") {
            configuration.config_map = Some(parse_namespaced_name(cm.as_str())?);
        }
        if let Some(limit) = lookup("SYNC_RATE_LIMIT") {
            let limit: f64 = parse("SYNC_RATE_LIMIT", limit.as_str())?;
            if !(limit > 0.0) {
                return Err(ControllerError::Configuration(format!(
                    "SYNC_RATE_LIMIT must be positive, got {}",
                    limit
                )));
            }
            configuration.sync_rate_limit = limit;
        }
        if let Some(secs) = lookup("PROVIDER_SYNC_PERIOD_SECS") {
            configuration.provider_sync_interval =
                parse_period("PROVIDER_SYNC_PERIOD_SECS", secs.as_str())?;
        }
        if let Some(secs) = lookup("STATUS_UPDATE_PERIOD_SECS") {
            configuration.status_update_interval =
                parse_period("STATUS_UPDATE_PERIOD_SECS", secs.as_str())?;
        }
        if let Some(id) = lookup("ELECTION_ID") {
            configuration.election_id = id;
        }
        if let Some(name) = lookup("POD_NAME") {
            configuration.pod_name = name;
        }
        if let Some(ns) = lookup("POD_NAMESPACE") {
            configuration.pod_namespace = ns;
        }
        if let Some(secs) = lookup("LEASE_DURATION_SECS") {
            configuration.lease_duration = parse_period("LEASE_DURATION_SECS", secs.as_str())?;
        }
        if let Some(retries) = lookup("SYNC_MAX_RETRIES") {
            configuration.retry_policy.max_retries = parse("SYNC_MAX_RETRIES", retries.as_str())?;
        }
        let metrics_addr = lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        configuration.metrics_addr = parse(
            "METRICS_LISTEN_ADDR",
            format!("{}:{}", metrics_addr, metrics_port).as_str(),
        )?;
        Ok(configuration)
    }
}

/// Derive the load balancer name prefix from the cluster name: the lowercase
/// hex encoding of the IEEE CRC32 checksum (big-endian digest bytes).
///
/// Independent controller instances managing the same cluster rely on this
/// being stable, never change it.
pub fn generate_name_prefix(cluster_name: &str) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(cluster_name.as_bytes());
    hex::encode(hasher.finalize().to_be_bytes())
}

fn parse<T>(name: &str, value: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| {
        ControllerError::Configuration(format!("invalid value {:?} for {}: {}", value, name, e))
    })
}

/// A period in whole seconds, zero is rejected.
fn parse_period(name: &str, value: &str) -> Result<Duration, ControllerError> {
    match parse(name, value)? {
        0 => Err(ControllerError::Configuration(format!(
            "{} must be at least one second",
            name
        ))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_namespaced_name(value: &str) -> Result<(String, String), ControllerError> {
    match value.split('/').collect::<Vec<_>>().as_slice() {
        [ns, name] if !ns.is_empty() && !name.is_empty() => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err(ControllerError::Configuration(format!(
            "expected namespace/name, got {:?}",
            value
        ))),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn name_prefix_is_stable() {
        assert_eq!(generate_name_prefix("my-cluster"), "81495355");
        assert_eq!(generate_name_prefix("my-cluster"), "81495355");
        assert_eq!(generate_name_prefix("prod-eks"), "74d40f3b");
        assert_eq!(generate_name_prefix(""), "00000000");
    }

    #[test]
    fn defaults() {
        let c = Configuration::from_lookup(lookup(&[("CLUSTER_NAME", "my-cluster")])).unwrap();
        assert_eq!(c.alb_name_prefix, "81495355");
        assert_eq!(c.sync_rate_limit, 0.3);
        assert_eq!(c.provider_sync_interval, Duration::from_secs(3600));
        assert_eq!(c.election_id, "ingress-controller-leader-alb");
        assert_eq!(c.metrics_addr, "0.0.0.0:9000".parse().unwrap());
        assert!(c.watch_namespace.is_none());
        assert!(c.config_map.is_none());
        assert_eq!(c.pod_namespace, "kube-system");
        assert_eq!(c.lease_duration, Duration::from_secs(15));
        assert!(c.pod_name.starts_with("alb-ingress-controller-"));
    }

    #[test]
    fn periods_must_be_positive() {
        let e = Configuration::from_lookup(lookup(&[
            ("CLUSTER_NAME", "my-cluster"),
            ("PROVIDER_SYNC_PERIOD_SECS", "0"),
        ]))
        .unwrap_err();
        assert_eq!(
            e.to_string(),
            "invalid configuration: PROVIDER_SYNC_PERIOD_SECS must be at least one second"
        );
        let c = Configuration::from_lookup(lookup(&[
            ("CLUSTER_NAME", "my-cluster"),
            ("PROVIDER_SYNC_PERIOD_SECS", "1"),
            ("POD_NAME", "alb-7d9f"),
            ("POD_NAMESPACE", "ingress"),
        ]))
        .unwrap();
        assert_eq!(c.provider_sync_interval, Duration::from_secs(1));
        assert_eq!(c.pod_name, "alb-7d9f");
        assert_eq!(c.pod_namespace, "ingress");
    }

    #[test]
    fn explicit_prefix_wins() {
        let c = Configuration::from_lookup(lookup(&[
            ("CLUSTER_NAME", "my-cluster"),
            ("ALB_NAME_PREFIX", "shop"),
            ("WATCH_NAMESPACE", "*"),
            ("CONFIG_MAP", "kube-system/alb-ingress"),
            ("PROVIDER_SYNC_PERIOD_SECS", "600"),
            ("SYNC_MAX_RETRIES", "2"),
        ]))
        .unwrap();
        assert_eq!(c.alb_name_prefix, "shop");
        assert!(c.watch_namespace.is_none());
        assert_eq!(
            c.config_map,
            Some(("kube-system".to_string(), "alb-ingress".to_string()))
        );
        assert_eq!(c.provider_sync_interval, Duration::from_secs(600));
        assert_eq!(c.retry_policy.max_retries, 2);
    }

    #[test]
    fn cluster_name_is_required() {
        let e = Configuration::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(e, ControllerError::Configuration(_)));
    }

    #[test]
    fn rejects_invalid_values() {
        for vars in [
            vec![("CLUSTER_NAME", "c"), ("SYNC_RATE_LIMIT", "0")],
            vec![("CLUSTER_NAME", "c"), ("SYNC_RATE_LIMIT", "fast")],
            vec![("CLUSTER_NAME", "c"), ("CONFIG_MAP", "no-namespace")],
            vec![("CLUSTER_NAME", "c"), ("METRICS_LISTEN_PORT", "http")],
            vec![("CLUSTER_NAME", "c"), ("PROVIDER_SYNC_PERIOD_SECS", "0")],
            vec![("CLUSTER_NAME", "c"), ("STATUS_UPDATE_PERIOD_SECS", "0")],
            vec![("CLUSTER_NAME", "c"), ("LEASE_DURATION_SECS", "0")],
        ] {
            assert!(
                Configuration::from_lookup(lookup(&vars)).is_err(),
                "{:?} should be rejected",
                vars
            );
        }
    }
}
