use crate::{KubernetesProvider, SmiProvider};
use kubert::index::IndexNamespacedResource;
use maesh_controller_core::{ConfigurationProvider, ServiceWithPort, TrafficType};
use maesh_controller_k8s_api::{self as k8s, access};
use maesh_controller_k8s_index::{Event, Ignored, Index, PortStateStore, SharedIndex, TcpPortTable};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct EmptyStore;

#[async_trait::async_trait]
impl PortStateStore for EmptyStore {
    async fn load(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(Default::default())
    }

    async fn save(&self, _entries: BTreeMap<String, String>) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn mk_table() -> Arc<TcpPortTable> {
    Arc::new(
        TcpPortTable::load(Box::new(EmptyStore), 10000, 10100)
            .await
            .unwrap(),
    )
}

fn mk_index() -> (SharedIndex, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ignored = Ignored::new("maesh", vec![]);
    (Index::shared(ignored, "maesh".to_string(), tx), rx)
}

fn mk_service(
    ns: &str,
    name: &str,
    ports: impl IntoIterator<Item = (Option<&'static str>, i32)>,
    annotations: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> k8s::Service {
    let annotations: BTreeMap<String, String> = annotations
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    k8s::Service {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(k8s::ServiceSpec {
            ports: Some(
                ports
                    .into_iter()
                    .map(|(name, port)| k8s::ServicePort {
                        name: name.map(ToString::to_string),
                        port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_endpoints(
    ns: &str,
    name: &str,
    addresses: impl IntoIterator<Item = &'static str>,
    ports: impl IntoIterator<Item = (Option<&'static str>, i32)>,
) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(
                addresses
                    .into_iter()
                    .map(|ip| k8s::EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .into_iter()
                    .map(|(name, port)| k8s::EndpointPort {
                        name: name.map(ToString::to_string),
                        port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

fn mk_traffic_target(ns: &str, name: &str, dest: &str) -> access::TrafficTarget {
    let mut target = access::TrafficTarget::new(
        name,
        access::TrafficTargetSpec {
            destination: access::TrafficTargetSubject {
                kind: "Service".to_string(),
                name: dest.to_string(),
                namespace: None,
            },
            sources: vec![],
        },
    );
    target.metadata.namespace = Some(ns.to_string());
    target
}

#[tokio::test]
async fn http_services_get_positional_entrypoints() {
    let (index, _rx) = mk_index();
    let table = mk_table().await;

    index
        .write()
        .apply(mk_service("default", "web", [(Some("http"), 80)], []));
    index.write().apply(mk_endpoints(
        "default",
        "web",
        ["10.0.0.1", "10.0.0.2"],
        [(Some("http"), 8080)],
    ));

    let provider = KubernetesProvider::new(index, TrafficType::Http, table);
    let config = provider.build_config().unwrap();

    let router = &config.http.routers["web-default-80"];
    assert_eq!(router.entry_points, vec!["http-5000".to_string()]);
    assert_eq!(router.rule, "Host(`web.default.maesh`)");
    assert_eq!(router.service, "web-default-80");

    let lb = &config.http.services["web-default-80"].load_balancer;
    assert!(lb.pass_host_header);
    let mut urls: Vec<_> = lb.servers.iter().map(|server| server.url.clone()).collect();
    urls.sort();
    assert_eq!(urls, vec!["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);

    assert!(config.tcp.routers.is_empty());
}

#[tokio::test]
async fn tcp_services_use_assigned_ports() {
    let (index, _rx) = mk_index();
    let table = mk_table().await;
    table
        .add(&ServiceWithPort {
            namespace: "default".to_string(),
            name: "db".to_string(),
            port: 5432,
        })
        .await
        .unwrap();

    index.write().apply(mk_service(
        "default",
        "db",
        [(None, 5432)],
        [(TrafficType::ANNOTATION, "tcp")],
    ));
    index
        .write()
        .apply(mk_endpoints("default", "db", ["10.0.0.5"], [(None, 5432)]));

    let provider = KubernetesProvider::new(index, TrafficType::Http, table);
    let config = provider.build_config().unwrap();

    let router = &config.tcp.routers["db-default-5432"];
    assert_eq!(router.entry_points, vec!["tcp-10000".to_string()]);
    assert_eq!(router.rule, "HostSNI(`*`)");

    let lb = &config.tcp.services["db-default-5432"].load_balancer;
    assert_eq!(lb.servers.len(), 1);
    assert_eq!(lb.servers[0].address, "10.0.0.5:5432");

    assert!(config.http.routers.is_empty());
}

#[tokio::test]
async fn unassigned_tcp_ports_are_not_routable() {
    let (index, _rx) = mk_index();
    let table = mk_table().await;

    index.write().apply(mk_service(
        "default",
        "db",
        [(None, 5432)],
        [(TrafficType::ANNOTATION, "tcp")],
    ));

    let provider = KubernetesProvider::new(index, TrafficType::Http, table);
    let config = provider.build_config().unwrap();
    assert!(config.tcp.routers.is_empty());
    assert!(config.tcp.services.is_empty());
}

#[tokio::test]
async fn smi_provider_denies_untargeted_services() {
    let (index, _rx) = mk_index();
    let table = mk_table().await;

    index
        .write()
        .apply(mk_service("default", "web", [(Some("http"), 80)], []));
    index.write().apply(mk_endpoints(
        "default",
        "web",
        ["10.0.0.1"],
        [(Some("http"), 8080)],
    ));

    let provider = SmiProvider::new(index.clone(), TrafficType::Http, table);
    let config = provider.build_config().unwrap();
    assert!(config.http.routers.is_empty());

    index
        .write()
        .apply(mk_traffic_target("default", "allow-web", "web"));
    let config = provider.build_config().unwrap();
    assert!(config.http.routers.contains_key("web-default-80"));
}

#[tokio::test]
async fn identical_cluster_state_builds_equal_configs() {
    let (index, _rx) = mk_index();
    let table = mk_table().await;

    index
        .write()
        .apply(mk_service("default", "web", [(Some("http"), 80)], []));
    index.write().apply(mk_endpoints(
        "default",
        "web",
        ["10.0.0.1"],
        [(Some("http"), 8080)],
    ));

    let provider = KubernetesProvider::new(index, TrafficType::Http, table);
    assert_eq!(
        provider.build_config().unwrap(),
        provider.build_config().unwrap()
    );
}
