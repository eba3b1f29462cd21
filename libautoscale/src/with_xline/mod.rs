//! Xline-backed plugin wiring.
//!
//! Cluster objects live in the store as YAML under `/registry/nodes/<name>`
//! and `/registry/pods/<namespace>/<name>`. This module provides the
//! production [`NodeFetcher`] plus a pod watcher feeding store events into the
//! dispatch layer.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use etcd_client::{Client, EventType, WatchOptions, WatchResponse};
use log::{error, warn};

use common::{Node, PodTask};

use crate::config::AutoscaleConfig;
use crate::models::PodName;
use crate::state::{AutoscalePlugin, NodeFetcher};

pub struct XlineNodeFetcher {
    client: Client,
}

impl XlineNodeFetcher {
    pub async fn connect(endpoints: &[&str]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeFetcher for XlineNodeFetcher {
    async fn fetch_node(&self, name: &str) -> Result<Node> {
        let mut client = self.client.clone();
        let resp = client.get(format!("/registry/nodes/{name}"), None).await?;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| anyhow!("node {name} not found in the store"))?;
        let node: Node = serde_yaml::from_slice(kv.value())
            .with_context(|| format!("undecodable node object for {name}"))?;
        Ok(node)
    }
}

/// Starts a plugin backed by the xline store and spawns a watcher that feeds
/// pod updates and deletions into the dispatch layer.
pub async fn run_plugin_with_xline(
    endpoints: &[&str],
    conf: AutoscaleConfig,
) -> Result<Arc<AutoscalePlugin>> {
    let fetcher = Arc::new(XlineNodeFetcher::connect(endpoints).await?);
    let plugin = Arc::new(AutoscalePlugin::new(conf, fetcher)?);

    let mut client = Client::connect(endpoints, None).await?;
    let (_, mut pods_watch_stream) = client
        .watch(
            "/registry/pods/".to_string(),
            Some(WatchOptions::new().with_prefix()),
        )
        .await?;

    let watched = plugin.clone();
    tokio::spawn(async move {
        loop {
            match pods_watch_stream.message().await {
                Ok(Some(resp)) => handle_pod_events(&watched, resp).await,
                Ok(None) => break,
                Err(e) => {
                    error!("pod watch stream failed: {e:?}");
                    break;
                }
            }
        }
    });
    Ok(plugin)
}

async fn handle_pod_events(plugin: &AutoscalePlugin, resp: WatchResponse) {
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        match event.event_type() {
            EventType::Put => match serde_yaml::from_slice::<PodTask>(kv.value()) {
                Ok(pod) if pod.vm_name().is_some() => {
                    if let Err(e) = plugin.handle_vm_pod_updated(&pod).await {
                        warn!("failed to apply update of pod {}: {e:?}", pod.metadata.name);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("undecodable pod object in watch event: {e:?}"),
            },
            EventType::Delete => {
                let key = String::from_utf8_lossy(kv.key()).to_string();
                let Some(name) = pod_name_from_key(&key) else {
                    warn!("pod deletion event with unexpected key {key}");
                    continue;
                };
                if let Err(e) = plugin.delete_pod(&name).await {
                    warn!("failed to apply deletion of pod {name}: {e:?}");
                }
            }
        }
    }
}

fn pod_name_from_key(key: &str) -> Option<PodName> {
    let rest = key.strip_prefix("/registry/pods/")?;
    let mut parts = rest.split('/').filter(|s| !s.is_empty());
    let first = parts.next()?;
    match parts.next() {
        Some(name) => Some(PodName::new(first, name)),
        None => Some(PodName::new("default", first)),
    }
}
