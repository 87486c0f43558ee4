use std::collections::VecDeque;

use crate::{generic::Generation, traits::Device};

/// Resource that is no longer needed by its owner
/// but may still be referenced by in-flight commands.
pub enum Retired<D: Device> {
    AccelerationStructure(D::AccelerationStructure),
    Buffer(D::Buffer),
    QueryPool(D::QueryPool),
}

impl<D> Retired<D>
where
    D: Device,
{
    fn destroy(self, device: &D) {
        match self {
            Retired::AccelerationStructure(accel) => device.destroy_acceleration_structure(accel),
            Retired::Buffer(buffer) => device.destroy_buffer(buffer),
            Retired::QueryPool(pool) => device.destroy_query_pool(pool),
        }
    }
}

/// Holds GPU resources until completion of the command list
/// generation that last referenced them is confirmed.
///
/// The queue never frees speculatively.
/// Completion is reported by the owner of the submission loop
/// via [`DeferredDestructionQueue::retire`].
pub struct DeferredDestructionQueue<D: Device> {
    device: D,
    pending: VecDeque<(Generation, Retired<D>)>,
    completed: Option<Generation>,
}

impl<D> DeferredDestructionQueue<D>
where
    D: Device,
{
    pub fn new(device: D) -> Self {
        DeferredDestructionQueue {
            device,
            pending: VecDeque::new(),
            completed: None,
        }
    }

    /// Enqueues resource last referenced by command list of `generation`.
    pub fn defer(&mut self, generation: Generation, item: Retired<D>) {
        debug_assert!(
            self.completed.map_or(true, |completed| generation > completed),
            "resource deferred to generation {generation} that already completed"
        );
        self.pending.push_back((generation, item));
    }

    pub fn defer_acceleration_structure(
        &mut self,
        generation: Generation,
        accel: D::AccelerationStructure,
    ) {
        self.defer(generation, Retired::AccelerationStructure(accel));
    }

    pub fn defer_buffer(&mut self, generation: Generation, buffer: D::Buffer) {
        self.defer(generation, Retired::Buffer(buffer));
    }

    pub fn defer_query_pool(&mut self, generation: Generation, pool: D::QueryPool) {
        self.defer(generation, Retired::QueryPool(pool));
    }

    /// Frees every resource whose generation is not after `completed`.
    ///
    /// Returns number of freed resources.
    pub fn retire(&mut self, completed: Generation) -> usize {
        self.completed = Some(self.completed.map_or(completed, |last| last.max(completed)));

        let before = self.pending.len();
        let pending = std::mem::take(&mut self.pending);
        for (generation, item) in pending {
            if generation <= completed {
                item.destroy(&self.device);
            } else {
                self.pending.push_back((generation, item));
            }
        }

        let freed = before - self.pending.len();
        if freed > 0 {
            tracing::trace!("Retired {freed} resources up to generation {completed}");
        }
        freed
    }

    /// Frees everything right away.
    ///
    /// Caller must guarantee that the device is idle.
    pub fn destroy_all_idle(&mut self) {
        for (_, item) in self.pending.drain(..) {
            item.destroy(&self.device);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Latest generation reported complete.
    pub fn completed(&self) -> Option<Generation> {
        self.completed
    }
}

impl<D> Drop for DeferredDestructionQueue<D>
where
    D: Device,
{
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                "Deferred destruction queue dropped with {} pending resources. They are leaked",
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generic::{AccelerationStructureDesc, AccelerationStructureLevel},
        headless::HeadlessDevice,
    };

    fn structure(device: &HeadlessDevice) -> <HeadlessDevice as Device>::AccelerationStructure {
        device
            .new_acceleration_structure(AccelerationStructureDesc {
                level: AccelerationStructureLevel::Bottom,
                size: 1024,
                name: "test",
            })
            .unwrap()
    }

    #[test]
    fn retire_waits_for_generation() {
        let device = HeadlessDevice::default();
        let mut queue = DeferredDestructionQueue::new(device.clone());

        queue.defer_acceleration_structure(Generation::new(5), structure(&device));
        assert_eq!(device.live_acceleration_structures(), 1);

        assert_eq!(queue.retire(Generation::new(4)), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(device.live_acceleration_structures(), 1);

        assert_eq!(queue.retire(Generation::new(5)), 1);
        assert!(queue.is_empty());
        assert_eq!(device.live_acceleration_structures(), 0);
    }

    #[test]
    fn retire_keeps_later_items_in_order() {
        let device = HeadlessDevice::default();
        let mut queue = DeferredDestructionQueue::new(device.clone());

        queue.defer_acceleration_structure(Generation::new(1), structure(&device));
        queue.defer_acceleration_structure(Generation::new(3), structure(&device));
        queue.defer_acceleration_structure(Generation::new(2), structure(&device));

        assert_eq!(queue.retire(Generation::new(2)), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.completed(), Some(Generation::new(2)));

        // Completion never goes backwards.
        assert_eq!(queue.retire(Generation::new(1)), 0);
        assert_eq!(queue.completed(), Some(Generation::new(2)));

        assert_eq!(queue.retire(Generation::new(3)), 1);
        assert_eq!(device.live_acceleration_structures(), 0);
    }

    #[test]
    fn destroy_all_idle_empties_queue() {
        let device = HeadlessDevice::default();
        let mut queue = DeferredDestructionQueue::new(device.clone());

        queue.defer_acceleration_structure(Generation::new(10), structure(&device));
        queue.destroy_all_idle();
        assert!(queue.is_empty());
        assert_eq!(device.live_acceleration_structures(), 0);
    }

    #[test]
    fn every_resource_kind_is_freed() {
        let device = HeadlessDevice::default();
        let mut queue = DeferredDestructionQueue::new(device.clone());

        queue.defer_acceleration_structure(Generation::new(1), structure(&device));
        queue.defer_buffer(Generation::new(1), device.new_upload_buffer(256).unwrap());
        queue.defer_query_pool(
            Generation::new(2),
            device.new_compacted_size_queries(4).unwrap(),
        );
        let buffers = device.live_buffers();

        assert_eq!(queue.retire(Generation::new(1)), 2);
        assert_eq!(device.live_acceleration_structures(), 0);
        assert!(device.live_buffers() < buffers);

        assert_eq!(queue.retire(Generation::new(2)), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn dropping_pending_queue_does_not_free() {
        let device = HeadlessDevice::default();
        let mut queue = DeferredDestructionQueue::new(device.clone());

        queue.defer_acceleration_structure(Generation::new(3), structure(&device));
        drop(queue);
        assert_eq!(device.live_acceleration_structures(), 1);
    }
}
