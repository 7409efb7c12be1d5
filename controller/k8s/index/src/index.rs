use crate::ignored::Ignored;
use crate::{COMPONENT_LABEL, COMPONENT_VALUE};
use ahash::AHashMap as HashMap;
use maesh_controller_k8s_api::{self as k8s, access::TrafficTarget, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Identifies a namespaced cluster object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

/// A data-plane proxy instance, as last observed from the pod watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshPod {
    pub name: String,
    pub ip: Option<String>,
    pub ready: bool,
}

/// A message from the change handler to the reconciler.
///
/// Service events carry the shadow operation to perform and are tagged
/// `force`; everything else is a plain refresh request.
#[derive(Debug)]
pub enum Event {
    ServiceCreated(Box<k8s::Service>),
    ServiceUpdated {
        old: Box<k8s::Service>,
        new: Box<k8s::Service>,
    },
    ServiceDeleted {
        namespace: String,
        name: String,
    },
    Refresh,
}

// === impl Event ===

impl Event {
    pub fn is_force(&self) -> bool {
        !matches!(self, Event::Refresh)
    }
}

/// Consumes cluster change notifications, filters them through the ignore
/// policy, maintains the cache the configuration providers read, and emits
/// coalesced refresh signals to the reconciler.
#[derive(Debug)]
pub struct Index {
    ignored: Ignored,
    mesh_namespace: String,
    events: UnboundedSender<Event>,

    services: HashMap<ServiceRef, k8s::Service>,
    endpoints: HashMap<ServiceRef, k8s::Endpoints>,
    mesh_pods: HashMap<String, MeshPod>,
    traffic_targets: HashMap<ServiceRef, ServiceRef>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        ignored: Ignored,
        mesh_namespace: String,
        events: UnboundedSender<Event>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            ignored,
            mesh_namespace,
            events,
            services: HashMap::new(),
            endpoints: HashMap::new(),
            mesh_pods: HashMap::new(),
            traffic_targets: HashMap::new(),
        }))
    }

    pub fn services(&self) -> impl Iterator<Item = (&ServiceRef, &k8s::Service)> {
        self.services.iter()
    }

    pub fn endpoints_of(&self, key: &ServiceRef) -> Option<&k8s::Endpoints> {
        self.endpoints.get(key)
    }

    pub fn mesh_pods(&self) -> Vec<MeshPod> {
        self.mesh_pods.values().cloned().collect()
    }

    /// Whether any traffic target names the given service as destination.
    pub fn has_traffic_target_for(&self, key: &ServiceRef) -> bool {
        self.traffic_targets.values().any(|dest| dest == key)
    }

    fn is_mesh_pod(&self, pod: &k8s::Pod, namespace: &str) -> bool {
        namespace == self.mesh_namespace
            && pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(COMPONENT_LABEL))
                .map(String::as_str)
                == Some(COMPONENT_VALUE)
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::error!("Refresh channel closed, dropping event");
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, service: k8s::Service) {
        let namespace = service.namespace().expect("Service must have a namespace");
        let name = service.name_unchecked();

        if self.ignored.is_ignored(&service.metadata) {
            return;
        }

        let key = ServiceRef {
            namespace,
            name,
        };
        match self.services.insert(key, service.clone()) {
            None => self.send(Event::ServiceCreated(Box::new(service))),
            Some(old) if old != service => self.send(Event::ServiceUpdated {
                old: Box::new(old),
                new: Box::new(service),
            }),
            Some(_) => {}
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceRef {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        // Ignored services are never cached, so a cache hit means the
        // deletion is observable.
        if self.services.remove(&key).is_some() {
            self.send(Event::ServiceDeleted { namespace, name });
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, endpoints: k8s::Endpoints) {
        let namespace = endpoints
            .namespace()
            .expect("Endpoints must have a namespace");
        let name = endpoints.name_unchecked();

        if self.ignored.is_ignored(&endpoints.metadata) {
            return;
        }

        let key = ServiceRef { namespace, name };
        match self.endpoints.insert(key, endpoints.clone()) {
            Some(old) if old == endpoints => {}
            _ => self.send(Event::Refresh),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceRef { namespace, name };
        if self.endpoints.remove(&key).is_some() {
            self.send(Event::Refresh);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("Pod must have a namespace");
        let name = pod.name_unchecked();

        // Track data-plane instances before the ignore policy drops the
        // event: the reconciler's fan-out reads this view.
        if self.is_mesh_pod(&pod, &namespace) {
            let status = pod.status.as_ref();
            let ip = status.and_then(|status| status.pod_ip.clone());
            let ready = status
                .and_then(|status| status.container_statuses.as_ref())
                .map(|statuses| statuses.iter().all(|status| status.ready))
                .unwrap_or(true);
            self.mesh_pods.insert(name.clone(), MeshPod { name, ip, ready });
        }

        if self.ignored.is_ignored(&pod.metadata) {
            return;
        }

        self.send(Event::Refresh);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.mesh_namespace {
            self.mesh_pods.remove(&name);
        }
        if self.ignored.is_ignored_namespace(&namespace) {
            return;
        }
        self.send(Event::Refresh);
    }
}

impl kubert::index::IndexNamespacedResource<TrafficTarget> for Index {
    fn apply(&mut self, target: TrafficTarget) {
        let namespace = target
            .namespace()
            .expect("TrafficTarget must have a namespace");
        let name = target.name_unchecked();

        let destination = ServiceRef {
            namespace: target
                .spec
                .destination
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.clone()),
            name: target.spec.destination.name.clone(),
        };
        self.traffic_targets
            .insert(ServiceRef { namespace, name }, destination);
        self.send(Event::Refresh);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceRef { namespace, name };
        if self.traffic_targets.remove(&key).is_some() {
            self.send(Event::Refresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubert::index::IndexNamespacedResource;
    use maesh_controller_k8s_api::access::{TrafficTargetSpec, TrafficTargetSubject};
    use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

    fn mk_index() -> (SharedIndex, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ignored = Ignored::new("maesh", vec![]);
        (Index::shared(ignored, "maesh".to_string(), tx), rx)
    }

    fn mk_service(ns: impl ToString, name: impl ToString, port: i32) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                ports: Some(vec![k8s::ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mk_pod(
        ns: impl ToString,
        name: impl ToString,
        labels: impl IntoIterator<Item = (&'static str, &'static str)>,
        ip: &str,
        ready: bool,
    ) -> k8s::Pod {
        k8s::Pod {
            metadata: k8s::ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(k8s::PodStatus {
                pod_ip: Some(ip.to_string()),
                container_statuses: Some(vec![k8s::ContainerStatus {
                    ready,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_lifecycle_emits_forced_events() {
        let (index, mut rx) = mk_index();

        index.write().apply(mk_service("default", "web", 80));
        match rx.try_recv().unwrap() {
            Event::ServiceCreated(svc) => assert_eq!(svc.name_unchecked(), "web"),
            other => panic!("unexpected event {:?}", other),
        }

        // An unchanged re-apply (informer resync) is quiet.
        index.write().apply(mk_service("default", "web", 80));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        index.write().apply(mk_service("default", "web", 8080));
        match rx.try_recv().unwrap() {
            Event::ServiceUpdated { old, new } => {
                assert_eq!(old.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 80);
                assert_eq!(new.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 8080);
            }
            other => panic!("unexpected event {:?}", other),
        }

        <Index as IndexNamespacedResource<k8s::Service>>::delete(
            &mut index.write(),
            "default".to_string(),
            "web".to_string(),
        );
        let event = rx.try_recv().unwrap();
        assert!(event.is_force());
        assert!(matches!(event, Event::ServiceDeleted { .. }));
    }

    #[test]
    fn ignored_services_are_dropped_at_entry() {
        let (index, mut rx) = mk_index();

        index.write().apply(mk_service("kube-system", "dns", 53));
        index.write().apply(mk_service("maesh", "anything", 80));
        index.write().apply(mk_service("default", "kubernetes", 443));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(index.read().services().count(), 0);
    }

    #[test]
    fn endpoints_emit_normal_refreshes() {
        let (index, mut rx) = mk_index();

        let endpoints = k8s::Endpoints {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        index.write().apply(endpoints.clone());
        let event = rx.try_recv().unwrap();
        assert!(!event.is_force());

        index.write().apply(endpoints);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn mesh_pods_are_tracked_but_never_trigger_refreshes() {
        let (index, mut rx) = mk_index();

        index.write().apply(mk_pod(
            "maesh",
            "mesh-proxy-1",
            [("app", "maesh"), ("component", "maesh-mesh")],
            "10.0.0.9",
            false,
        ));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let pods = index.read().mesh_pods();
        assert_eq!(
            pods,
            vec![MeshPod {
                name: "mesh-proxy-1".to_string(),
                ip: Some("10.0.0.9".to_string()),
                ready: false,
            }]
        );

        // A user pod elsewhere does trigger a refresh.
        index
            .write()
            .apply(mk_pod("default", "web-1", [("app", "web")], "10.0.1.4", true));
        assert!(matches!(rx.try_recv(), Ok(Event::Refresh)));

        <Index as IndexNamespacedResource<k8s::Pod>>::delete(
            &mut index.write(),
            "maesh".to_string(),
            "mesh-proxy-1".to_string(),
        );
        assert!(index.read().mesh_pods().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn traffic_targets_filter_destinations() {
        let (index, mut rx) = mk_index();

        let mut target = TrafficTarget::new(
            "allow-web",
            TrafficTargetSpec {
                destination: TrafficTargetSubject {
                    kind: "Service".to_string(),
                    name: "web".to_string(),
                    namespace: None,
                },
                sources: vec![],
            },
        );
        target.metadata.namespace = Some("default".to_string());
        index.write().apply(target);
        assert!(matches!(rx.try_recv(), Ok(Event::Refresh)));

        let web = ServiceRef {
            namespace: "default".to_string(),
            name: "web".to_string(),
        };
        assert!(index.read().has_traffic_target_for(&web));
        let other = ServiceRef {
            namespace: "default".to_string(),
            name: "db".to_string(),
        };
        assert!(!index.read().has_traffic_target_for(&other));

        <Index as IndexNamespacedResource<TrafficTarget>>::delete(
            &mut index.write(),
            "default".to_string(),
            "allow-web".to_string(),
        );
        assert!(matches!(rx.try_recv(), Ok(Event::Refresh)));
        assert!(!index.read().has_traffic_target_for(&web));
    }
}
