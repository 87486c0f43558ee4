use crate::{
    deferred::DeferredDestructionQueue,
    generic::{align_up, BufferDesc, BufferRange, BufferUsage, Generation, Memory, OutOfMemory},
    traits::{Buffer, Device},
};

/// Transient device memory for acceleration structure builds.
///
/// Capacity grows monotonically and never shrinks.
/// The pool is exclusively owned by its manager; commands of previous
/// frames that still use the buffer are ordered by the frame loop.
pub struct ScratchPool<D: Device> {
    device: D,
    name: String,
    buffer: Option<D::Buffer>,
    alignment: usize,
}

impl<D> ScratchPool<D>
where
    D: Device,
{
    pub fn new(device: D, name: impl Into<String>) -> Self {
        let alignment = device.limits().min_scratch_offset_alignment.max(1);
        ScratchPool {
            device,
            name: name.into(),
            buffer: None,
            alignment,
        }
    }

    /// Alignment of scratch sub-ranges.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Allocated size in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.size())
    }

    /// Makes sure at least `required` bytes are available.
    ///
    /// The replacement buffer is allocated before the old one is retired,
    /// so on failure the pool keeps its previous buffer.
    /// The old buffer is deferred to `generation`.
    pub fn ensure(
        &mut self,
        required: usize,
        deferred: &mut DeferredDestructionQueue<D>,
        generation: Generation,
    ) -> Result<(), OutOfMemory> {
        if required <= self.capacity() {
            return Ok(());
        }

        let size = align_up(required, self.alignment);
        let buffer = self.device.new_buffer(BufferDesc {
            size,
            align: self.alignment,
            usage: BufferUsage::SCRATCH | BufferUsage::STORAGE,
            memory: Memory::Device,
            name: &self.name,
        })?;

        tracing::debug!(
            "Scratch pool '{}' grows from {} to {} bytes",
            self.name,
            self.capacity(),
            size
        );

        if let Some(old) = self.buffer.replace(buffer) {
            deferred.defer_buffer(generation, old);
        }
        Ok(())
    }

    /// Returns whole scratch range, if any memory is allocated.
    pub fn range(&self) -> Option<BufferRange<'_, D::Buffer>> {
        self.buffer.as_ref().map(BufferRange::whole)
    }

    /// Gives the buffer back to the device once `generation` completes.
    pub fn release(&mut self, deferred: &mut DeferredDestructionQueue<D>, generation: Generation) {
        if let Some(buffer) = self.buffer.take() {
            deferred.defer_buffer(generation, buffer);
        }
    }
}

/// Lays out scratch sub-ranges for builds that run concurrently.
///
/// Returns offset of each range and total size.
pub fn scratch_layout(
    sizes: impl IntoIterator<Item = usize>,
    alignment: usize,
) -> (Vec<usize>, usize) {
    let mut total = 0;
    let offsets = sizes
        .into_iter()
        .map(|size| {
            let offset = align_up(total, alignment);
            total = offset + size;
            offset
        })
        .collect();
    (offsets, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn pool_never_shrinks() {
        let device = HeadlessDevice::default();
        let mut deferred = DeferredDestructionQueue::new(device.clone());
        let mut pool = ScratchPool::new(device.clone(), "scratch");

        let mut generation = Generation::new(1);
        let mut last = 0;
        for required in [4096, 1000, 8192, 16, 0, 5000] {
            pool.ensure(required, &mut deferred, generation).unwrap();
            assert!(pool.capacity() >= required);
            assert!(pool.capacity() >= last);
            last = pool.capacity();
            generation = generation.next();
        }
        assert_eq!(last, 8192);

        // Only the second growth had a buffer to retire.
        assert_eq!(deferred.len(), 1);
        deferred.retire(generation);
        pool.release(&mut deferred, generation.next());
        deferred.retire(generation.next());
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn failed_growth_keeps_old_buffer() {
        let device = HeadlessDevice::with_memory_budget(8192);
        let mut deferred = DeferredDestructionQueue::new(device.clone());
        let mut pool = ScratchPool::new(device.clone(), "scratch");

        pool.ensure(4096, &mut deferred, Generation::new(1)).unwrap();
        assert_eq!(
            pool.ensure(1 << 20, &mut deferred, Generation::new(2)),
            Err(OutOfMemory)
        );
        assert_eq!(pool.capacity(), 4096);
        assert!(deferred.is_empty());
        pool.release(&mut deferred, Generation::new(2));
        deferred.destroy_all_idle();
    }

    #[test]
    fn layout_aligns_every_range() {
        let (offsets, total) = scratch_layout([100, 300, 1], 256);
        assert_eq!(offsets, [0, 256, 768]);
        assert_eq!(total, 769);

        let (offsets, total) = scratch_layout(std::iter::empty(), 256);
        assert!(offsets.is_empty());
        assert_eq!(total, 0);
    }
}
