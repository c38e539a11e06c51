use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::nodes::apply_cluster_nodes;
use crate::cluster::ProxyState;
use crate::metrics;
use crate::protocol::RespValue;

/// Keep the slot table fresh: refresh on a periodic tick and whenever a
/// MOVED redirection fires the trigger, both throttled by the state's
/// `update_slots_min_limit` floor.
pub fn spawn(state: Arc<ProxyState>, mut trigger: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.update_slots_min_limit);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                received = trigger.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }
            if !state.refresh_due() {
                continue;
            }
            match refresh_once(&state).await {
                Ok(applied) => {
                    metrics::topology_refresh();
                    debug!(applied, "cluster topology refreshed");
                }
                Err(err) => warn!(error = %err, "cluster topology refresh failed"),
            }
        }
    })
}

/// Ask one randomly chosen instance for `CLUSTER NODES` and rebuild slot
/// ownership from its answer, then drop instances left without slots.
pub async fn refresh_once(state: &ProxyState) -> Result<usize> {
    let target = state
        .registry
        .random()
        .ok_or_else(|| anyhow!("no backend instances registered"))?;
    let link = target.link(0);
    let receiver = link.request(cluster_nodes_command()).await?;
    let reply = receiver
        .await
        .map_err(|_| anyhow!("backend link closed before CLUSTER NODES reply"))?;

    let text = match reply {
        RespValue::BulkString(text) => text,
        RespValue::Error(err) => {
            bail!("CLUSTER NODES failed: {}", String::from_utf8_lossy(&err))
        }
        other => bail!("unexpected CLUSTER NODES reply: {other:?}"),
    };

    let applied = apply_cluster_nodes(&text, &target, &state.registry, &state.slots).await?;
    if state.registry.remove_unused() > 0 {
        state.schedule_save();
    }
    Ok(applied)
}

fn cluster_nodes_command() -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(Bytes::from_static(b"CLUSTER")),
        RespValue::BulkString(Bytes::from_static(b"NODES")),
    ])
}
