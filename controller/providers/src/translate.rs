use maesh_controller_core::{
    DynamicConfiguration, HttpLoadBalancer, HttpRouter, HttpServer, HttpService, ServiceWithPort,
    TcpLoadBalancer, TcpRouter, TcpServer, TcpService, TrafficType,
};
use maesh_controller_k8s_api as k8s;
use maesh_controller_k8s_index::{ServiceRef, TcpPortTable};

/// Appends the routers and load balancers for one user service.
pub(crate) fn append_service(
    config: &mut DynamicConfiguration,
    key: &ServiceRef,
    service: &k8s::Service,
    endpoints: Option<&k8s::Endpoints>,
    mode: TrafficType,
    table: &TcpPortTable,
) {
    let ports = match service.spec.as_ref().and_then(|spec| spec.ports.as_ref()) {
        Some(ports) => ports,
        None => return,
    };

    for (id, sp) in ports.iter().enumerate() {
        if sp.protocol.as_deref().unwrap_or("TCP") != "TCP" {
            continue;
        }

        let router_key = format!("{}-{}-{}", key.name, key.namespace, sp.port);
        match mode {
            TrafficType::Http => {
                config.http.routers.insert(
                    router_key.clone(),
                    HttpRouter {
                        entry_points: vec![format!("http-{}", 5000 + id)],
                        rule: format!("Host(`{}.{}.maesh`)", key.name, key.namespace),
                        service: router_key.clone(),
                    },
                );
                config.http.services.insert(
                    router_key,
                    HttpService {
                        load_balancer: HttpLoadBalancer {
                            servers: http_servers(endpoints, sp),
                            pass_host_header: true,
                        },
                    },
                );
            }
            TrafficType::Tcp => {
                // Only previously allocated ports are routable; allocation
                // happens on the shadow-service path, never here.
                let svc = ServiceWithPort {
                    namespace: key.namespace.clone(),
                    name: key.name.clone(),
                    port: sp.port,
                };
                let entry_port = match table.find(&svc) {
                    Some(port) => port,
                    None => {
                        tracing::debug!(
                            service = %format_args!("{}/{}", key.namespace, key.name),
                            port = sp.port,
                            "No TCP port assigned yet, skipping",
                        );
                        continue;
                    }
                };

                config.tcp.routers.insert(
                    router_key.clone(),
                    TcpRouter {
                        entry_points: vec![format!("tcp-{}", entry_port)],
                        rule: "HostSNI(`*`)".to_string(),
                        service: router_key.clone(),
                    },
                );
                config.tcp.services.insert(
                    router_key,
                    TcpService {
                        load_balancer: TcpLoadBalancer {
                            servers: tcp_servers(endpoints, sp),
                        },
                    },
                );
            }
        }
    }
}

fn http_servers(endpoints: Option<&k8s::Endpoints>, sp: &k8s::ServicePort) -> Vec<HttpServer> {
    endpoint_addresses(endpoints, sp)
        .into_iter()
        .map(|(ip, port)| HttpServer {
            url: format!("http://{}:{}", ip, port),
        })
        .collect()
}

fn tcp_servers(endpoints: Option<&k8s::Endpoints>, sp: &k8s::ServicePort) -> Vec<TcpServer> {
    endpoint_addresses(endpoints, sp)
        .into_iter()
        .map(|(ip, port)| TcpServer {
            address: format!("{}:{}", ip, port),
        })
        .collect()
}

/// Resolves the endpoint `(ip, port)` pairs backing one service port.
/// Endpoint ports correspond to service ports by name; a subset with a single
/// unnamed port backs an unnamed service port.
fn endpoint_addresses(
    endpoints: Option<&k8s::Endpoints>,
    sp: &k8s::ServicePort,
) -> Vec<(String, i32)> {
    let subsets = match endpoints.and_then(|ep| ep.subsets.as_ref()) {
        Some(subsets) => subsets,
        None => return Vec::new(),
    };

    let mut out = Vec::new();
    for subset in subsets {
        let port = subset
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|port| port.name == sp.name)
            .map(|port| port.port);
        let port = match port {
            Some(port) => port,
            None => continue,
        };

        for address in subset.addresses.as_deref().unwrap_or_default() {
            out.push((address.ip.clone(), port));
        }
    }
    out
}
