use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::backend::{Instance, InstanceRegistry, SlotTable};
use crate::protocol::SLOT_COUNT;

const NODE_ID_LEN: usize = 40;

/// Apply one `CLUSTER NODES` bulk reply to the slot table.
///
/// Lines are applied in place: the random bootstrap guarantees every slot
/// already has some owner, so readers never observe an unassigned slot
/// mid-update. Returns the number of slot assignments written.
///
/// Per line: fields are whitespace separated, the first must be a 40-char
/// node id, replicas (`slave` flag) are skipped, `myself` refers to the
/// instance that answered the query, and slot fields past the eighth
/// column are single slots, `start-stop` ranges, or bracketed migration
/// entries (skipped).
pub async fn apply_cluster_nodes(
    text: &[u8],
    polled: &Arc<Instance>,
    registry: &InstanceRegistry,
    slots: &SlotTable,
) -> Result<usize> {
    let text = match std::str::from_utf8(text) {
        Ok(text) => text,
        Err(_) => bail!("CLUSTER NODES reply is not valid utf-8"),
    };

    let mut applied = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[0].len() != NODE_ID_LEN {
            debug!(line, "skipping malformed cluster nodes line");
            continue;
        }
        let flags = fields[2];
        if flags.contains("slave") {
            continue;
        }

        let instance = if flags.contains("myself") {
            polled.clone()
        } else {
            // Current servers report "ip:port@cport"; only ip:port matters.
            let addr = fields[1].split('@').next().unwrap_or(fields[1]);
            match registry.get_or_create(addr).await {
                Ok(instance) => instance,
                Err(err) => {
                    warn!(addr, error = %err, "skipping unusable cluster node");
                    continue;
                }
            }
        };

        for field in &fields[8..] {
            if field.starts_with('[') {
                continue;
            }
            match parse_slot_field(field) {
                Some((start, stop)) => {
                    for slot in start..=stop {
                        slots.set(slot, instance.clone());
                        applied += 1;
                    }
                }
                None => warn!(field, "ignoring malformed slot field"),
            }
        }
    }
    Ok(applied)
}

fn parse_slot_field(field: &str) -> Option<(u16, u16)> {
    let (start, stop) = match field.split_once('-') {
        Some((start, stop)) => (start.parse::<u16>().ok()?, stop.parse::<u16>().ok()?),
        None => {
            let slot = field.parse::<u16>().ok()?;
            (slot, slot)
        }
    };
    (start <= stop && stop < SLOT_COUNT).then_some((start, stop))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(seed: u8) -> String {
        let c = (b'a' + seed) as char;
        std::iter::repeat(c).take(NODE_ID_LEN).collect()
    }

    async fn fixture() -> (InstanceRegistry, SlotTable, Arc<Instance>) {
        let registry = InstanceRegistry::new(1);
        let polled = registry.get_or_create("127.0.0.1:7301").await.unwrap();
        let slots = SlotTable::new();
        slots.bootstrap_random(&[polled.clone()]);
        (registry, slots, polled)
    }

    #[tokio::test]
    async fn applies_masters_and_skips_slaves() {
        let (registry, slots, polled) = fixture().await;
        let text = format!(
            "{} 127.0.0.1:7301@17301 myself,master - 0 0 1 connected 0-8191\n\
             {} 127.0.0.1:7302@17302 master - 0 0 2 connected 8192-16382 16383\n\
             {} 127.0.0.1:7303@17303 slave {} 0 0 2 connected\n",
            node_id(0),
            node_id(1),
            node_id(2),
            node_id(1),
        );

        let applied = apply_cluster_nodes(text.as_bytes(), &polled, &registry, &slots)
            .await
            .unwrap();
        assert_eq!(applied, SLOT_COUNT as usize);
        assert!(slots.is_fully_assigned());

        let other = registry.get("127.0.0.1:7302").unwrap();
        assert_eq!(polled.slots_num(), 8192);
        assert_eq!(other.slots_num(), 8192);
        // The slave never becomes an instance.
        assert!(registry.get("127.0.0.1:7303").is_none());
    }

    #[tokio::test]
    async fn skips_migration_entries_and_junk_lines() {
        let (registry, slots, polled) = fixture().await;
        let text = format!(
            "# comment\n\
             \n\
             short line\n\
             {} 127.0.0.1:7301@17301 myself,master - 0 0 1 connected 0-16383 [42->-{}]\n",
            node_id(0),
            node_id(1),
        );

        let applied = apply_cluster_nodes(text.as_bytes(), &polled, &registry, &slots)
            .await
            .unwrap();
        assert_eq!(applied, SLOT_COUNT as usize);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let (registry, slots, polled) = fixture().await;
        let text = format!(
            "{} 127.0.0.1:7301@17301 myself,master - 0 0 1 connected 0-9999\n\
             {} 127.0.0.1:7304@17304 master - 0 0 2 connected 10000-16383\n",
            node_id(0),
            node_id(3),
        );

        apply_cluster_nodes(text.as_bytes(), &polled, &registry, &slots)
            .await
            .unwrap();
        let first = (polled.slots_num(), registry.len());

        apply_cluster_nodes(text.as_bytes(), &polled, &registry, &slots)
            .await
            .unwrap();
        assert_eq!((polled.slots_num(), registry.len()), first);
        assert_eq!(slots.count_owned_by(&polled), polled.slots_num());
    }

    #[tokio::test]
    async fn orphan_instances_are_collected_after_refresh() {
        let (registry, slots, polled) = fixture().await;
        // An instance that will lose all its slots.
        registry.get_or_create("127.0.0.1:7305").await.unwrap();
        let text = format!(
            "{} 127.0.0.1:7301@17301 myself,master - 0 0 1 connected 0-16383\n",
            node_id(0),
        );

        apply_cluster_nodes(text.as_bytes(), &polled, &registry, &slots)
            .await
            .unwrap();
        assert_eq!(registry.remove_unused(), 1);
        assert!(registry.get("127.0.0.1:7305").is_none());
        assert!(registry.get(polled.name()).is_some());
    }

    #[test]
    fn slot_field_bounds() {
        assert_eq!(parse_slot_field("42"), Some((42, 42)));
        assert_eq!(parse_slot_field("0-16383"), Some((0, 16383)));
        assert_eq!(parse_slot_field("16384"), None);
        assert_eq!(parse_slot_field("9-3"), None);
        assert_eq!(parse_slot_field("x-3"), None);
    }
}
