use ahash::AHashSet as HashSet;
use maesh_controller_k8s_api as k8s;

const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
const DEFAULT_NAMESPACE: &str = "default";

/// The immutable set of cluster objects the mesh never observes.
///
/// The mesh namespace and the cluster's own system namespace are always
/// ignored, as are the data-plane pods themselves (by app label).
#[derive(Clone, Debug)]
pub struct Ignored {
    namespaces: HashSet<String>,
    services: HashSet<(String, String)>,
    apps: HashSet<String>,
}

// === impl Ignored ===

impl Ignored {
    pub fn new(mesh_namespace: &str, extra_namespaces: impl IntoIterator<Item = String>) -> Self {
        let mut namespaces: HashSet<String> = extra_namespaces.into_iter().collect();
        namespaces.insert(mesh_namespace.to_string());
        namespaces.insert(KUBE_SYSTEM_NAMESPACE.to_string());

        let mut services = HashSet::new();
        services.insert(("kubernetes".to_string(), DEFAULT_NAMESPACE.to_string()));

        let mut apps = HashSet::new();
        apps.insert("maesh".to_string());
        apps.insert("jaeger".to_string());

        Self {
            namespaces,
            services,
            apps,
        }
    }

    pub fn is_ignored(&self, meta: &k8s::ObjectMeta) -> bool {
        if let Some(app) = meta.labels.as_ref().and_then(|l| l.get(crate::APP_LABEL)) {
            if self.apps.contains(app) {
                return true;
            }
        }

        let namespace = meta.namespace.as_deref().unwrap_or_default();
        if self.namespaces.contains(namespace) {
            return true;
        }

        if let Some(name) = meta.name.as_deref() {
            if self
                .services
                .contains(&(name.to_string(), namespace.to_string()))
            {
                return true;
            }
        }

        false
    }

    pub fn is_ignored_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }
}
