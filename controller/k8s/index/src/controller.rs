use crate::deploy_log::DeployLog;
use crate::index::{Event, MeshPod, SharedIndex};
use crate::retry::Backoff;
use crate::shadow::ShadowServiceManager;
use anyhow::Context as _;
use futures::future;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use maesh_controller_core::{ConfigurationProvider, DynamicConfiguration};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio::time;

const RESYNC_PERIOD: Duration = Duration::from_secs(10);
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
const PUSH_BACKOFF_BUDGET: Duration = Duration::from_secs(15);
const PROXY_CONFIG_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("unable to find any active mesh pods to deploy configuration to")]
    NoInstances,

    #[error("unable to marshal configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("configuration deployment failed for {failed} of {total} instances")]
    Failed { failed: usize, total: usize },
}

/// Owns the refresh loop: debounce, rebuild, diff, fan out, re-sync laggards.
///
/// Cycles are strictly serial; shadow-service operations carried by the
/// refresh channel execute in arrival order before each rebuild.
pub struct Controller {
    index: SharedIndex,
    provider: Box<dyn ConfigurationProvider + Send + Sync>,
    shadow: ShadowServiceManager,
    events: UnboundedReceiver<Event>,
    deploy_log: Arc<DeployLog>,
    last_config: Arc<RwLock<Option<DynamicConfiguration>>>,
    ready: watch::Sender<bool>,
    client: hyper::Client<HttpConnector>,
}

// === impl Controller ===

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: SharedIndex,
        provider: Box<dyn ConfigurationProvider + Send + Sync>,
        shadow: ShadowServiceManager,
        events: UnboundedReceiver<Event>,
        deploy_log: Arc<DeployLog>,
        last_config: Arc<RwLock<Option<DynamicConfiguration>>>,
        ready: watch::Sender<bool>,
    ) -> Self {
        Self {
            index,
            provider,
            shadow,
            events,
            deploy_log,
            last_config,
            ready,
            client: hyper::Client::new(),
        }
    }

    pub async fn run(mut self, shutdown: drain::Watch) {
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        let mut resync = time::interval_at(time::Instant::now() + RESYNC_PERIOD, RESYNC_PERIOD);

        loop {
            tokio::select! {
                _ = &mut signaled => {
                    tracing::info!("Shutting down");
                    return;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.refresh(event).await,
                    None => return,
                },
                _ = resync.tick() => self.resync().await,
            }
        }
    }

    async fn refresh(&mut self, first: Event) {
        // Drain everything queued behind the first signal so that a burst of
        // notifications produces a single rebuild.
        let mut force = first.is_force();
        let mut events = vec![first];
        while let Ok(event) = self.events.try_recv() {
            force |= event.is_force();
            events.push(event);
        }
        for event in events {
            self.apply_shadow(event).await;
        }

        let config = match self.provider.build_config() {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%error, "Unable to build configuration");
                return;
            }
        };

        if !should_deploy(self.last_config.read().as_ref(), &config, force) {
            return;
        }

        *self.last_config.write() = Some(config.clone());
        match self.deploy_to_all(&config).await {
            Ok(()) => {
                let _ = self.ready.send(true);
            }
            Err(error) => tracing::error!(%error, "Unable to deploy configuration"),
        }
    }

    async fn resync(&self) {
        let config = match self.last_config.read().clone() {
            Some(config) => config,
            None => return,
        };

        tracing::debug!("Deploying configuration to unready instances");
        match self.deploy_to_unready(&config).await {
            Ok(()) => {
                let _ = self.ready.send(true);
            }
            Err(error) => {
                tracing::debug!(%error, "Unable to deploy configuration to unready instances")
            }
        }
    }

    async fn apply_shadow(&self, event: Event) {
        match event {
            Event::ServiceCreated(service) => {
                if let Err(error) = self.shadow.create(&service).await {
                    tracing::error!(%error, "Unable to create shadow service");
                }
            }
            Event::ServiceUpdated { old, new } => {
                if let Err(error) = self.shadow.update(&old, &new).await {
                    tracing::error!(%error, "Unable to update shadow service");
                }
            }
            Event::ServiceDeleted { namespace, name } => {
                if let Err(error) = self.shadow.delete(&namespace, &name).await {
                    tracing::error!(%error, "Unable to delete shadow service");
                }
            }
            Event::Refresh => {}
        }
    }

    async fn deploy_to_all(&self, config: &DynamicConfiguration) -> Result<(), DeployError> {
        let pods = self.index.read().mesh_pods();
        if pods.is_empty() {
            return Err(DeployError::NoInstances);
        }
        deploy_to_pods(
            &self.client,
            &self.deploy_log,
            pods,
            PROXY_CONFIG_PORT,
            PUSH_BACKOFF_BUDGET,
            config,
        )
        .await
    }

    async fn deploy_to_unready(&self, config: &DynamicConfiguration) -> Result<(), DeployError> {
        let pods = self.index.read().mesh_pods();
        if pods.is_empty() {
            return Err(DeployError::NoInstances);
        }
        let unready = pods.into_iter().filter(|pod| !pod.ready).collect();
        deploy_to_pods(
            &self.client,
            &self.deploy_log,
            unready,
            PROXY_CONFIG_PORT,
            PUSH_BACKOFF_BUDGET,
            config,
        )
        .await
    }
}

/// A configuration deep-equal to the last one only redeploys when the cycle
/// was forced.
fn should_deploy(
    last: Option<&DynamicConfiguration>,
    next: &DynamicConfiguration,
    force: bool,
) -> bool {
    force || last != Some(next)
}

/// Pushes one configuration to every given pod in parallel.
///
/// Best-effort-all: individual failures are logged to the deploy log and do
/// not interrupt the other pushes, but the cycle reports an aggregate error.
async fn deploy_to_pods(
    client: &hyper::Client<HttpConnector>,
    log: &DeployLog,
    pods: Vec<MeshPod>,
    port: u16,
    backoff_budget: Duration,
    config: &DynamicConfiguration,
) -> Result<(), DeployError> {
    // Serialize once so every instance in the cycle receives identical bytes.
    let body = Bytes::from(serde_json::to_vec(config)?);

    let total = pods.len();
    let pushes = pods.into_iter().map(|pod| {
        let body = body.clone();
        async move {
            deploy_to_pod(client, log, &pod, port, backoff_budget, body)
                .await
                .is_ok()
        }
    });

    let failed = future::join_all(pushes)
        .await
        .into_iter()
        .filter(|ok| !*ok)
        .count();
    if failed > 0 {
        return Err(DeployError::Failed { failed, total });
    }
    Ok(())
}

async fn deploy_to_pod(
    client: &hyper::Client<HttpConnector>,
    log: &DeployLog,
    pod: &MeshPod,
    port: u16,
    backoff_budget: Duration,
    body: Bytes,
) -> anyhow::Result<()> {
    let ip = match pod.ip.as_deref() {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => {
            log.log_deploy(&pod.name, "", false, "pod has no assigned IP");
            anyhow::bail!("pod {} has no assigned IP", pod.name);
        }
    };

    tracing::debug!(pod = %pod.name, %ip, "Deploying configuration to pod");

    let mut backoff = Backoff::new(backoff_budget);
    loop {
        match put_config(client, &ip, port, body.clone()).await {
            Ok(()) => {
                log.log_deploy(&pod.name, &ip, true, "");
                tracing::debug!(pod = %pod.name, %ip, "Successfully deployed configuration");
                return Ok(());
            }
            Err(error) => {
                log.log_deploy(&pod.name, &ip, false, error.to_string());
                match backoff.next_delay() {
                    Some(delay) => time::sleep(delay).await,
                    None => return Err(error),
                }
            }
        }
    }
}

async fn put_config(
    client: &hyper::Client<HttpConnector>,
    ip: &str,
    port: u16,
    body: Bytes,
) -> anyhow::Result<()> {
    let uri = format!("http://{}:{}/api/providers/rest", ip, port);
    let request = hyper::Request::builder()
        .method(hyper::Method::PUT)
        .uri(&uri)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(body))
        .context("unable to build request")?;

    let response = time::timeout(PUSH_TIMEOUT, client.request(request))
        .await
        .map_err(|_| anyhow::anyhow!("configuration push timed out"))?
        .context("unable to deploy configuration")?;

    let status = response.status();
    hyper::body::to_bytes(response.into_body())
        .await
        .context("unable to read response body")?;

    if status != hyper::StatusCode::OK {
        anyhow::bail!("received non-ok response code: {}", status.as_u16());
    }
    Ok(())
}
