use crate::translate;
use maesh_controller_core::{ConfigurationProvider, DynamicConfiguration, TrafficType};
use maesh_controller_k8s_index::{SharedIndex, TcpPortTable};
use std::sync::Arc;

/// Builds a configuration exposing every non-ignored user service.
pub struct KubernetesProvider {
    index: SharedIndex,
    default_mode: TrafficType,
    table: Arc<TcpPortTable>,
}

// === impl KubernetesProvider ===

impl KubernetesProvider {
    pub fn new(index: SharedIndex, default_mode: TrafficType, table: Arc<TcpPortTable>) -> Self {
        Self {
            index,
            default_mode,
            table,
        }
    }
}

impl ConfigurationProvider for KubernetesProvider {
    fn build_config(&self) -> anyhow::Result<DynamicConfiguration> {
        let index = self.index.read();

        let mut config = DynamicConfiguration::default();
        for (key, service) in index.services() {
            let mode =
                TrafficType::from_annotations(service.metadata.annotations.as_ref(), self.default_mode);
            translate::append_service(
                &mut config,
                key,
                service,
                index.endpoints_of(key),
                mode,
                &self.table,
            );
        }

        Ok(config)
    }
}
