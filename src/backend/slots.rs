use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::backend::instance::Instance;
use crate::protocol::SLOT_COUNT;

/// The routing table: one owning instance per hash slot.
///
/// `set` is the only mutator and keeps every instance's `slots_num` in
/// step with the table, on both the previous and the new owner.
pub struct SlotTable {
    slots: RwLock<Vec<Option<Arc<Instance>>>>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            slots: RwLock::new(vec![None; SLOT_COUNT as usize]),
        }
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: u16) -> Option<Arc<Instance>> {
        self.slots.read()[slot as usize].clone()
    }

    pub fn set(&self, slot: u16, instance: Arc<Instance>) {
        let mut guard = self.slots.write();
        let entry = &mut guard[slot as usize];
        if let Some(previous) = entry.take() {
            previous.decr_slots();
        }
        instance.incr_slots();
        *entry = Some(instance);
    }

    /// Pin every slot to a randomly chosen instance so forwarding works
    /// before the first topology refresh lands. Misroutes are corrected
    /// by MOVED redirections.
    pub fn bootstrap_random(&self, instances: &[Arc<Instance>]) {
        assert!(!instances.is_empty(), "bootstrap requires at least one instance");
        let mut rng = rand::thread_rng();
        for slot in 0..SLOT_COUNT {
            let choice = instances
                .choose(&mut rng)
                .expect("instance list is non-empty")
                .clone();
            self.set(slot, choice);
        }
    }

    /// Number of slots currently pointing at `instance`; test support for
    /// the `slots_num` bookkeeping invariant.
    pub fn count_owned_by(&self, instance: &Arc<Instance>) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|entry| {
                entry
                    .as_ref()
                    .map(|owner| Arc::ptr_eq(owner, instance))
                    .unwrap_or(false)
            })
            .count()
    }

    /// True once every slot has an owner.
    pub fn is_fully_assigned(&self) -> bool {
        self.slots.read().iter().all(|entry| entry.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::instance::InstanceRegistry;

    async fn two_instances() -> (Arc<Instance>, Arc<Instance>) {
        let registry = InstanceRegistry::new(1);
        let a = registry.get_or_create("127.0.0.1:7201").await.unwrap();
        let b = registry.get_or_create("127.0.0.1:7202").await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn set_maintains_slots_num_on_both_owners() {
        let (a, b) = two_instances().await;
        let table = SlotTable::new();

        table.set(0, a.clone());
        table.set(1, a.clone());
        assert_eq!(a.slots_num(), 2);

        table.set(1, b.clone());
        assert_eq!(a.slots_num(), 1);
        assert_eq!(b.slots_num(), 1);

        // Re-assigning to the same owner is a no-op for the count.
        table.set(0, a.clone());
        assert_eq!(a.slots_num(), 1);
    }

    #[tokio::test]
    async fn slots_num_matches_recount() {
        let (a, b) = two_instances().await;
        let table = SlotTable::new();
        table.bootstrap_random(&[a.clone(), b.clone()]);

        assert!(table.is_fully_assigned());
        assert_eq!(table.count_owned_by(&a), a.slots_num());
        assert_eq!(table.count_owned_by(&b), b.slots_num());
        assert_eq!(a.slots_num() + b.slots_num(), SLOT_COUNT as usize);
    }
}
