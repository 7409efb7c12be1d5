use crate::retry::{is_not_found, retry_on_conflict};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Context, Result};
use maesh_controller_core::ServiceWithPort;
use maesh_controller_k8s_api as k8s;
use parking_lot::RwLock;
use std::collections::BTreeMap;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("unable to find an available port")]
    Exhausted,

    #[error("unable to save TCP port mapping: {0}")]
    Save(anyhow::Error),
}

/// Durable storage for the port table, keyed and valued as strings exactly as
/// the backing document stores them.
#[async_trait::async_trait]
pub trait PortStateStore {
    async fn load(&self) -> Result<BTreeMap<String, String>>;
    async fn save(&self, entries: BTreeMap<String, String>) -> Result<()>;
}

/// A `PortStateStore` backed by a ConfigMap in the mesh namespace.
///
/// Saves are read-modify-write: the current document is re-read and the local
/// table merged over it, so entries written by other processes survive.
pub struct ConfigMapStore {
    api: k8s::Api<k8s::ConfigMap>,
    name: String,
}

// === impl ConfigMapStore ===

impl ConfigMapStore {
    pub fn new(api: k8s::Api<k8s::ConfigMap>, name: String) -> Self {
        Self { api, name }
    }
}

#[async_trait::async_trait]
impl PortStateStore for ConfigMapStore {
    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(cm.data.unwrap_or_default()),
            Err(error) if is_not_found(&error) => {
                tracing::info!(name = %self.name, "State ConfigMap not found, creating it");
                let cm = k8s::ConfigMap {
                    metadata: k8s::ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.api
                    .create(&k8s::PostParams::default(), &cm)
                    .await
                    .with_context(|| format!("unable to create state ConfigMap {}", self.name))?;
                Ok(Default::default())
            }
            Err(error) => Err(error)
                .with_context(|| format!("unable to load state from ConfigMap {}", self.name)),
        }
    }

    async fn save(&self, entries: BTreeMap<String, String>) -> Result<()> {
        retry_on_conflict(|| {
            let entries = entries.clone();
            async move {
                let mut cm = self.api.get(&self.name).await?;
                cm.data.get_or_insert_with(Default::default).extend(entries);
                self.api
                    .replace(&self.name, &k8s::PostParams::default(), &cm)
                    .await?;
                Ok(())
            }
        })
        .await
        .with_context(|| format!("unable to update state ConfigMap {}", self.name))
    }
}

/// The durable bijection between `(namespace, service, port)` triples and a
/// bounded port range.
///
/// The in-memory table is authoritative for lookups; persistence is an upsert
/// of the whole table. A failed save keeps the in-memory claim: the next
/// successful save flushes it, whereas rolling back could double-assign a
/// port another writer already observed as taken.
pub struct TcpPortTable {
    table: RwLock<HashMap<i32, ServiceWithPort>>,
    min_port: i32,
    max_port: i32,
    store: Box<dyn PortStateStore + Send + Sync>,
}

// === impl TcpPortTable ===

impl TcpPortTable {
    /// Rehydrates the table from the store. Unparseable entries are skipped
    /// with a warning; a store read failure is fatal to the caller.
    pub async fn load(
        store: Box<dyn PortStateStore + Send + Sync>,
        min_port: i32,
        max_port: i32,
    ) -> Result<Self> {
        let mut table = HashMap::default();
        for (key, value) in store.load().await? {
            let port = match key.parse::<i32>() {
                Ok(port) => port,
                Err(_) => {
                    tracing::warn!(%key, "Skipping entry with unparseable port");
                    continue;
                }
            };
            match parse_service_name_port(&value) {
                Ok(svc) => {
                    table.insert(port, svc);
                }
                Err(error) => {
                    tracing::warn!(%key, %value, %error, "Skipping unparseable entry");
                }
            }
        }

        Ok(Self {
            table: RwLock::new(table),
            min_port,
            max_port,
            store,
        })
    }

    /// Returns the port currently assigned to the given service port, if any.
    pub fn find(&self, svc: &ServiceWithPort) -> Option<i32> {
        let table = self.table.read();
        table
            .iter()
            .find(|(_, assigned)| *assigned == svc)
            .map(|(port, _)| *port)
    }

    /// Inverse lookup.
    pub fn get(&self, port: i32) -> Option<ServiceWithPort> {
        self.table.read().get(&port).cloned()
    }

    /// Assigns the lowest unassigned port in the range to `svc` and persists
    /// the table. An already-assigned service port returns its existing port
    /// without consuming a new slot.
    pub async fn add(&self, svc: &ServiceWithPort) -> Result<i32, PortError> {
        let (port, claimed) = {
            let mut table = self.table.write();
            if let Some(port) = table
                .iter()
                .find(|(_, assigned)| *assigned == svc)
                .map(|(port, _)| *port)
            {
                (port, false)
            } else {
                let port = (self.min_port..=self.max_port)
                    .find(|p| !table.contains_key(p))
                    .ok_or(PortError::Exhausted)?;
                table.insert(port, svc.clone());
                (port, true)
            }
        };

        if claimed {
            if let Err(error) = self.store.save(self.entries()).await {
                return Err(PortError::Save(error));
            }
        }

        Ok(port)
    }

    fn entries(&self) -> BTreeMap<String, String> {
        self.table
            .read()
            .iter()
            .map(|(port, svc)| {
                (
                    port.to_string(),
                    format_service_name_port(&svc.namespace, &svc.name, svc.port),
                )
            })
            .collect()
    }
}

pub(crate) fn format_service_name_port(namespace: &str, name: &str, port: i32) -> String {
    format!("{}/{}:{}", namespace, name, port)
}

/// Parses a `"<namespace>/<name>:<port>"` entry. The legacy `"<name>:<port>"`
/// form is accepted and resolved against the default namespace.
pub(crate) fn parse_service_name_port(value: &str) -> Result<ServiceWithPort> {
    let (service, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("could not parse service into name and port"))?;
    let port = port.parse::<i32>().context("parsing port")?;

    let (namespace, name) = match service.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (DEFAULT_NAMESPACE, service),
    };

    Ok(ServiceWithPort {
        namespace: namespace.to_string(),
        name: name.to_string(),
        port,
    })
}
