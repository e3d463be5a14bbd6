use std::collections::BTreeMap;
use std::fmt;

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Tag carrying the namespace of the Ingress a cloud resource was created for.
pub const NAMESPACE_TAG: &str = "kubernetes.io/namespace";

/// Tag carrying the name of the Ingress a cloud resource was created for.
pub const INGRESS_NAME_TAG: &str = "kubernetes.io/ingress-name";

/// Prefix of the cluster ownership tag, the full key is `kubernetes.io/cluster/{cluster}`.
pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// The ownership tag key for the given cluster.
pub fn cluster_tag(cluster_name: &str) -> String {
    format!("{}{}", CLUSTER_TAG_PREFIX, cluster_name)
}

/// Stable identity of a Kubernetes object, used as work queue key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The Kubernetes Kind, e.g. `Ingress`.
    pub kind: String,
    /// The object's namespace, `None` for cluster scoped objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The object's name (`metadata.name`).
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.map(|v| v.to_string()),
            name: name.to_string(),
        }
    }

    /// Build the key of an arbitrary Kubernetes resource with a static type.
    pub fn from_resource<K>(obj: &K) -> Self
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let dt = K::DynamicType::default();
        Self {
            kind: K::kind(&dt).to_string(),
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A cloud resource and the tags it carries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct TaggedResource {
    /// The provider specific resource identifier (ARN).
    pub arn: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TaggedResource {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.as_str())
    }

    /// Returns `(namespace, ingress name)` if the resource is tagged with an owning Ingress.
    pub fn ingress_owner(&self) -> Option<(&str, &str)> {
        match (self.tag(NAMESPACE_TAG), self.tag(INGRESS_NAME_TAG)) {
            (Some(ns), Some(name)) => Some((ns, name)),
            _ => None,
        }
    }

    pub fn is_owned_by_cluster(&self, cluster_name: &str) -> bool {
        self.tags.contains_key(cluster_tag(cluster_name).as_str())
    }
}

/// A load balancer as returned by the tagging inventory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct LoadBalancer {
    #[serde(flatten)]
    pub resource: TaggedResource,
    /// Public DNS name, if known.
    #[serde(rename = "dnsName", skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

impl LoadBalancer {
    /// The load balancer name, which is the second to last segment of its ARN
    /// (`...:loadbalancer/app/{name}/{id}`).
    pub fn name(&self) -> Option<&str> {
        let mut segments = self.resource.arn.rsplit('/');
        segments.next()?;
        segments.next()
    }
}

/// All cloud resources tagged as owned by one cluster.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterResources {
    #[serde(rename = "loadBalancers", default)]
    pub load_balancers: Vec<LoadBalancer>,
    #[serde(rename = "targetGroups", default)]
    pub target_groups: Vec<TaggedResource>,
    #[serde(default)]
    pub listeners: Vec<TaggedResource>,
    #[serde(rename = "listenerRules", default)]
    pub listener_rules: Vec<TaggedResource>,
    #[serde(default)]
    pub subnets: Vec<TaggedResource>,
}

/// Cloud resources reconciled for a single Ingress.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IngressBinding {
    /// The Ingress these resources were provisioned for.
    pub ingress: ObjectKey,
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancer,
    #[serde(rename = "targetGroups", default)]
    pub target_groups: Vec<TaggedResource>,
    #[serde(default)]
    pub listeners: Vec<TaggedResource>,
    #[serde(rename = "listenerRules", default)]
    pub listener_rules: Vec<TaggedResource>,
}

impl IngressBinding {
    /// The hostname that should be reported in the Ingress status.
    pub fn hostname(&self) -> Option<&str> {
        self.load_balancer.dns_name.as_deref()
    }
}

/// The controller's snapshot of observed cloud state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RunningConfiguration {
    #[serde(default)]
    pub ingresses: Vec<IngressBinding>,
}

impl RunningConfiguration {
    pub fn binding(&self, ingress: &ObjectKey) -> Option<&IngressBinding> {
        self.ingresses
            .iter()
            .find(|b| b.ingress.namespace == ingress.namespace && b.ingress.name == ingress.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::api::ObjectMeta;

    fn tagged(arn: &str, tags: &[(&str, &str)]) -> TaggedResource {
        TaggedResource {
            arn: arn.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn object_key_from_ingress() {
        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ObjectKey::from_resource(&ingress);
        assert_eq!(key.kind, "Ingress");
        assert_eq!(key.to_string(), "shop/web");
    }

    #[test]
    fn cluster_scoped_key_has_no_namespace_segment() {
        let key = ObjectKey::new("IngressClass", None, "alb");
        assert_eq!(key.to_string(), "alb");
    }

    #[test]
    fn ingress_owner_requires_both_tags() {
        let full = tagged(
            "arn:tg/1",
            &[(NAMESPACE_TAG, "shop"), (INGRESS_NAME_TAG, "web")],
        );
        assert_eq!(full.ingress_owner(), Some(("shop", "web")));
        let partial = tagged("arn:tg/2", &[(NAMESPACE_TAG, "shop")]);
        assert_eq!(partial.ingress_owner(), None);
    }

    #[test]
    fn cluster_ownership() {
        let r = tagged("arn:lb", &[("kubernetes.io/cluster/prod", "owned")]);
        assert!(r.is_owned_by_cluster("prod"));
        assert!(!r.is_owned_by_cluster("staging"));
    }

    #[test]
    fn load_balancer_name_from_arn() {
        let lb = LoadBalancer {
            resource: tagged(
                "arn:aws:elasticloadbalancing:eu-west-1:123456789012:loadbalancer/app/81495355-shop-web/50dc6c495c0c9188",
                &[],
            ),
            dns_name: None,
        };
        assert_eq!(lb.name(), Some("81495355-shop-web"));
    }

    #[test]
    fn running_configuration_lookup_ignores_kind() {
        let running = RunningConfiguration {
            ingresses: vec![IngressBinding {
                ingress: ObjectKey::new("Ingress", Some("shop"), "web"),
                load_balancer: LoadBalancer {
                    resource: tagged("arn:lb", &[]),
                    dns_name: Some("web.elb.example.com".to_string()),
                },
                target_groups: vec![],
                listeners: vec![],
                listener_rules: vec![],
            }],
        };
        let binding = running
            .binding(&ObjectKey::new("", Some("shop"), "web"))
            .expect("binding");
        assert_eq!(binding.hostname(), Some("web.elb.example.com"));
        assert!(
            running
                .binding(&ObjectKey::new("Ingress", Some("shop"), "api"))
                .is_none()
        );
    }

    #[test]
    fn cluster_resources_deserialize_with_missing_lists() {
        let r: ClusterResources = serde_json::from_str(
            r#"{"loadBalancers":[{"arn":"arn:lb","dnsName":"lb.example.com","tags":{}}]}"#,
        )
        .unwrap();
        assert_eq!(r.load_balancers.len(), 1);
        assert_eq!(
            r.load_balancers[0].dns_name.as_deref(),
            Some("lb.example.com")
        );
        assert!(r.subnets.is_empty());
    }
}
