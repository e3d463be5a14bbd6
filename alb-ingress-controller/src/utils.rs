use json_patch::diff;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

/// Hostnames currently published in the Ingress status, sorted.
pub(crate) fn published_hostnames(ingress: &Ingress) -> Vec<String> {
    let mut hostnames: Vec<String> = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| entries.iter().filter_map(|e| e.hostname.clone()).collect())
        .unwrap_or_default();
    hostnames.sort();
    hostnames
}

/// JSON patch setting the load balancer status of `ingress` to `hostnames`,
/// `None` if the status is already up to date.
pub(crate) fn status_patch(
    ingress: &Ingress,
    hostnames: &[String],
) -> Result<Option<json_patch::Patch>, ControllerError> {
    let mut expected = hostnames.to_vec();
    expected.sort();
    expected.dedup();
    if published_hostnames(ingress) == expected {
        return Ok(None);
    }
    let mut modified = ingress.clone();
    let entries: Vec<IngressLoadBalancerIngress> = expected
        .into_iter()
        .map(|hostname| IngressLoadBalancerIngress {
            hostname: Some(hostname),
            ..Default::default()
        })
        .collect();
    modified.status = Some(IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: if entries.is_empty() {
                None
            } else {
                Some(entries)
            },
        }),
    });
    let patch = diff(
        &serde_json::to_value(ingress)?,
        &serde_json::to_value(&modified)?,
    );
    if patch.0.is_empty() {
        Ok(None)
    } else {
        Ok(Some(patch))
    }
}

/// Apply a status patch, returns `false` if the Ingress no longer exists.
pub(crate) async fn patch_status(
    api: &Api<Ingress>,
    ingress: &Ingress,
    patch: json_patch::Patch,
) -> Result<bool, ControllerError> {
    let params = PatchParams {
        field_manager: Some(MANAGER.to_string()),
        ..Default::default()
    };
    match api
        .patch_status(
            ingress.name_any().as_str(),
            &params,
            &Patch::<Ingress>::Json(patch),
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("alb_ingress_{}", name)
}
