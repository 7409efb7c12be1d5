use crate::translate;
use maesh_controller_core::{ConfigurationProvider, DynamicConfiguration, TrafficType};
use maesh_controller_k8s_index::{SharedIndex, TcpPortTable};
use std::sync::Arc;

/// Policy-aware provider: a user service is only exposed when at least one
/// traffic target names it as destination (default deny).
pub struct SmiProvider {
    index: SharedIndex,
    default_mode: TrafficType,
    table: Arc<TcpPortTable>,
}

// === impl SmiProvider ===

impl SmiProvider {
    pub fn new(index: SharedIndex, default_mode: TrafficType, table: Arc<TcpPortTable>) -> Self {
        Self {
            index,
            default_mode,
            table,
        }
    }
}

impl ConfigurationProvider for SmiProvider {
    fn build_config(&self) -> anyhow::Result<DynamicConfiguration> {
        let index = self.index.read();

        let mut config = DynamicConfiguration::default();
        for (key, service) in index.services() {
            if !index.has_traffic_target_for(key) {
                tracing::debug!(
                    service = %format_args!("{}/{}", key.namespace, key.name),
                    "No traffic target for service, skipping",
                );
                continue;
            }

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
