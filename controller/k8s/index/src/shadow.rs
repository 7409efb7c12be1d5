use crate::ports::TcpPortTable;
use crate::retry::{is_not_found, retry_on_conflict};
use crate::{Ignored, APP_LABEL, APP_VALUE, COMPONENT_LABEL, COMPONENT_VALUE};
use anyhow::{Context, Result};
use maesh_controller_core::{ServiceWithPort, TrafficType};
use maesh_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Derives the mesh-side name for a user service. The hex interfix keeps the
/// derived name from colliding with user-chosen names.
pub fn shadow_service_name(mesh_namespace: &str, name: &str, namespace: &str) -> String {
    format!("{}-{}-6d61657368-{}", mesh_namespace, name, namespace)
}

/// Maintains one mesh-namespace service per user service.
pub struct ShadowServiceManager {
    mesh_api: k8s::Api<k8s::Service>,
    cluster_api: k8s::Api<k8s::Service>,
    mesh_namespace: String,
    default_mode: TrafficType,
    table: Arc<TcpPortTable>,
}

// === impl ShadowServiceManager ===

impl ShadowServiceManager {
    pub fn new(
        client: k8s::Client,
        mesh_namespace: String,
        default_mode: TrafficType,
        table: Arc<TcpPortTable>,
    ) -> Self {
        Self {
            mesh_api: k8s::Api::namespaced(client.clone(), &mesh_namespace),
            cluster_api: k8s::Api::all(client),
            mesh_namespace,
            default_mode,
            table,
        }
    }

    /// Creates a shadow service for every non-ignored user service that does
    /// not already have one. Pre-existing shadow services are left untouched.
    pub async fn sync(&self, ignored: &Ignored) -> Result<()> {
        let services = self
            .cluster_api
            .list(&k8s::ListParams::default())
            .await
            .context("unable to list user services")?;

        for service in services {
            if ignored.is_ignored(&service.metadata) {
                continue;
            }
            self.create(&service).await?;
        }

        Ok(())
    }

    pub async fn create(&self, service: &k8s::Service) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_unchecked();
        let shadow_name = shadow_service_name(&self.mesh_namespace, &name, &namespace);

        match self.mesh_api.get(&shadow_name).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => {
                let ports = shadow_ports(service, self.default_mode, &self.table).await;
                let shadow = self.mk_shadow(&shadow_name, ports);
                self.mesh_api
                    .create(&k8s::PostParams::default(), &shadow)
                    .await
                    .with_context(|| format!("unable to create shadow service {}", shadow_name))?;
                tracing::info!(%namespace, %name, %shadow_name, "Created shadow service");
                Ok(())
            }
            Err(error) => Err(error)
                .with_context(|| format!("unable to check if shadow service {} exists", shadow_name)),
        }
    }

    /// Rewrites the shadow's ports from the new user service spec. The
    /// get-mutate-replace is wrapped in a conflict-retry loop.
    pub async fn update(&self, old: &k8s::Service, new: &k8s::Service) -> Result<k8s::Service> {
        let namespace = old.namespace().unwrap_or_default();
        let name = old.name_unchecked();
        let shadow_name = shadow_service_name(&self.mesh_namespace, &name, &namespace);

        let updated = retry_on_conflict(|| async {
            let mut shadow = self.mesh_api.get(&shadow_name).await?;
            let ports = shadow_ports(new, self.default_mode, &self.table).await;
            shadow.spec.get_or_insert_with(Default::default).ports = Some(ports);
            self.mesh_api
                .replace(&shadow_name, &k8s::PostParams::default(), &shadow)
                .await
        })
        .await
        .with_context(|| format!("unable to update shadow service {}", shadow_name))?;

        tracing::debug!(%shadow_name, "Updated shadow service");
        Ok(updated)
    }

    /// Deletes the shadow for a deleted user service; not-found is success.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let shadow_name = shadow_service_name(&self.mesh_namespace, name, namespace);

        match self
            .mesh_api
            .delete(&shadow_name, &k8s::DeleteParams::default())
            .await
        {
            Ok(_) => {
                tracing::debug!(%shadow_name, "Deleted shadow service");
                Ok(())
            }
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("unable to delete shadow service {}", shadow_name))
            }
        }
    }

    fn mk_shadow(&self, shadow_name: &str, ports: Vec<k8s::ServicePort>) -> k8s::Service {
        k8s::Service {
            metadata: k8s::ObjectMeta {
                name: Some(shadow_name.to_string()),
                namespace: Some(self.mesh_namespace.clone()),
                labels: Some(BTreeMap::from([(
                    APP_LABEL.to_string(),
                    APP_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(k8s::ServiceSpec {
                ports: Some(ports),
                selector: Some(BTreeMap::from([(
                    COMPONENT_LABEL.to_string(),
                    COMPONENT_VALUE.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Builds the shadow's ports from the user service's declared ports.
///
/// Non-TCP ports are skipped, but still advance the positional index so that
/// `5000 + id` is stable for a given service spec. In TCP mode an exhausted
/// or unpersistable allocation skips the port and keeps going.
pub(crate) async fn shadow_ports(
    service: &k8s::Service,
    default_mode: TrafficType,
    table: &TcpPortTable,
) -> Vec<k8s::ServicePort> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_unchecked();
    let mode = TrafficType::from_annotations(service.metadata.annotations.as_ref(), default_mode);

    let declared = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default();

    let mut ports = Vec::new();
    for (id, sp) in declared.into_iter().enumerate() {
        let protocol = sp.protocol.as_deref().unwrap_or("TCP");
        if protocol != "TCP" {
            tracing::warn!(
                %protocol,
                port = sp.port,
                service = %format_args!("{}/{}", namespace, name),
                "Unsupported port type, skipping port",
            );
            continue;
        }

        let target_port = match mode {
            TrafficType::Http => 5000 + id as i32,
            TrafficType::Tcp => {
                let svc = ServiceWithPort {
                    namespace: namespace.clone(),
                    name: name.clone(),
                    port: sp.port,
                };
                match table.add(&svc).await {
                    Ok(port) => port,
                    Err(error) => {
                        tracing::warn!(
                            %error,
                            port = sp.port,
                            service = %format_args!("{}/{}", namespace, name),
                            "Unable to assign a TCP port, skipping port",
                        );
                        continue;
                    }
                }
            }
        };

        ports.push(k8s::ServicePort {
            name: sp.name,
            port: sp.port,
            target_port: Some(k8s::IntOrString::Int(target_port)),
            ..Default::default()
        });
    }

    ports
}
