//! Child objects of a ServiceInstance: the route service proxy Deployment and
//! Service, and the claim and volume of a volume instance.

use crate::constants::{
    COMPONENT_LABEL, DEFAULT_VOLUME_CAPACITY, MANAGED_BY, MANAGED_BY_LABEL, NAME_LABEL,
    ROUTE_SERVICE_PROXY_CONTAINER_NAME, ROUTE_SERVICE_PROXY_PORT, ROUTE_SERVICE_PROXY_PORT_NAME,
};
use crate::controller::names::generate_name;
use crate::crd::condition::MessageError;
use crate::crd::ServiceInstance;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, NFSVolumeSource, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec, PodSpec,
    PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, TCPSocketAction,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

const ROUTE_SERVICE_COMPONENT: &str = "route-service";

/// True when `meta` names `owner` as its controller
pub fn is_controlled_by<K: Resource>(meta: &ObjectMeta, owner: &K) -> bool {
    let Some(owner_uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    meta.owner_references.as_ref().is_some_and(|refs| {
        refs.iter()
            .any(|r| r.controller == Some(true) && r.uid == owner_uid)
    })
}

fn owned_meta(instance: &ServiceInstance, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: instance.namespace(),
        owner_references: instance.controller_owner_ref(&()).map(|r| vec![r]),
        labels: Some(instance.labels().clone()),
        ..ObjectMeta::default()
    }
}

pub fn deployment_name(instance: &ServiceInstance) -> String {
    generate_name(&[&instance.name_any(), "proxy"])
}

pub fn pod_labels(instance: &ServiceInstance) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), format!("{}-proxy", instance.name_any())),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (COMPONENT_LABEL.to_string(), ROUTE_SERVICE_COMPONENT.to_string()),
    ])
}

/// Proxy Deployment forwarding traffic through a user-provided route service
pub fn make_deployment(
    instance: &ServiceInstance,
    proxy_image: Option<&str>,
) -> Result<Deployment, MessageError> {
    let image = proxy_image.filter(|i| !i.is_empty()).ok_or_else(|| {
        MessageError("config value for RouteServiceProxyImage couldn't be found".to_string())
    })?;
    let route_service_url = instance.spec.route_service_url().unwrap_or_default();

    let tcp_probe = Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(ROUTE_SERVICE_PROXY_PORT),
            host: None,
        }),
        ..Probe::default()
    };

    let container = Container {
        name: ROUTE_SERVICE_PROXY_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(ROUTE_SERVICE_PROXY_PORT_NAME.to_string()),
            container_port: ROUTE_SERVICE_PROXY_PORT,
            ..ContainerPort::default()
        }]),
        env: Some(vec![
            EnvVar {
                name: "ROUTE_SERVICE_URL".to_string(),
                value: Some(route_service_url.to_string()),
                value_from: None,
            },
            EnvVar {
                name: "PORT".to_string(),
                value: Some(ROUTE_SERVICE_PROXY_PORT.to_string()),
                value_from: None,
            },
        ]),
        stdin: Some(false),
        tty: Some(false),
        liveness_probe: Some(tcp_probe.clone()),
        readiness_probe: Some(tcp_probe),
        ..Container::default()
    };

    Ok(Deployment {
        metadata: owned_meta(instance, deployment_name(instance)),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels(instance)),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(instance)),
                    annotations: Some(BTreeMap::from([
                        ("sidecar.istio.io/inject".to_string(), "true".to_string()),
                        (
                            "traffic.sidecar.istio.io/includeOutboundIPRanges".to_string(),
                            "*".to_string(),
                        ),
                    ])),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    enable_service_links: Some(false),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            revision_history_limit: Some(1),
            replicas: Some(1),
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

/// Desired Deployment with the identity of the stored one, or `None` when
/// nothing this controller manages differs
pub fn reconcile_deployment(desired: &Deployment, actual: &Deployment) -> Option<Deployment> {
    let managed = |d: &Deployment| {
        let spec = d.spec.as_ref();
        (
            d.metadata.labels.clone(),
            spec.and_then(|s| s.replicas),
            spec.and_then(|s| s.selector.match_labels.clone()),
            spec.and_then(|s| s.template.metadata.as_ref())
                .map(|m| (m.labels.clone(), m.annotations.clone())),
            spec.and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers.first())
                .map(|c| (c.image.clone(), c.env.clone(), c.ports.clone())),
        )
    };
    if managed(desired) == managed(actual) {
        return None;
    }
    let mut updated = actual.clone();
    updated.metadata.labels.clone_from(&desired.metadata.labels);
    updated.spec.clone_from(&desired.spec);
    Some(updated)
}

/// ClusterIP Service in front of the proxy pods
pub fn make_service(instance: &ServiceInstance) -> Service {
    Service {
        metadata: owned_meta(instance, deployment_name(instance)),
        spec: Some(ServiceSpec {
            selector: Some(pod_labels(instance)),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(ROUTE_SERVICE_PROXY_PORT_NAME.to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(ROUTE_SERVICE_PROXY_PORT)),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// Stored Service carrying the desired selector and ports, or `None` when in sync
pub fn reconcile_service(desired: &Service, actual: &Service) -> Option<Service> {
    let managed = |s: &Service| {
        let spec = s.spec.as_ref();
        (
            s.metadata.labels.clone(),
            spec.and_then(|s| s.selector.clone()),
            spec.and_then(|s| s.ports.clone()),
        )
    };
    if managed(desired) == managed(actual) {
        return None;
    }
    let mut updated = actual.clone();
    updated.metadata.labels.clone_from(&desired.metadata.labels);
    if let (Some(spec), Some(desired_spec)) = (updated.spec.as_mut(), desired.spec.as_ref()) {
        spec.selector.clone_from(&desired_spec.selector);
        spec.ports.clone_from(&desired_spec.ports);
    }
    Some(updated)
}

pub fn persistent_volume_name(instance: &ServiceInstance) -> String {
    generate_name(&[
        &instance.name_any(),
        &instance.namespace().unwrap_or_default(),
        "pv",
    ])
}

pub fn persistent_volume_claim_name(instance: &ServiceInstance) -> String {
    generate_name(&[&instance.name_any(), "pvc"])
}

fn capacity() -> BTreeMap<String, Quantity> {
    BTreeMap::from([(
        "storage".to_string(),
        Quantity(DEFAULT_VOLUME_CAPACITY.to_string()),
    )])
}

/// Claim for a volume instance; the capacity is nominal since the volume is NFS
pub fn make_persistent_volume_claim(instance: &ServiceInstance) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: owned_meta(instance, persistent_volume_claim_name(instance)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(capacity()),
                limits: None,
            }),
            storage_class_name: Some(String::new()),
            volume_name: Some(persistent_volume_name(instance)),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

/// Cluster scoped NFS volume pre-bound to the instance's claim
pub fn make_persistent_volume(
    instance: &ServiceInstance,
    server: &str,
    path: &str,
    claim: &PersistentVolumeClaim,
) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(persistent_volume_name(instance)),
            labels: Some(instance.labels().clone()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity()),
            access_modes: Some(vec![
                "ReadOnlyMany".to_string(),
                "ReadWriteMany".to_string(),
                "ReadWriteOnce".to_string(),
            ]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            nfs: Some(NFSVolumeSource {
                server: server.to_string(),
                path: path.to_string(),
                read_only: None,
            }),
            claim_ref: Some(ObjectReference {
                name: claim.metadata.name.clone(),
                namespace: claim.metadata.namespace.clone(),
                ..ObjectReference::default()
            }),
            ..PersistentVolumeSpec::default()
        }),
        status: None,
    }
}
