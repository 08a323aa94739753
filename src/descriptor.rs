/*! Descriptor set layouts, a pool-backed growable allocator, and a set
 * manager that records pending writes and flushes them in one update.
 */

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use ash::vk;

use crate::context::{DeviceShared, RenderContext};

/// Initial capacity per descriptor type for newly created pools.
pub const DEFAULT_DESCRIPTOR_POOL_PER_TYPE_CAPACITY: u32 = 256;

const POOL_DESCRIPTOR_TYPES: &[vk::DescriptorType] = &[
    vk::DescriptorType::SAMPLER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::SAMPLED_IMAGE,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
    vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
    vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    vk::DescriptorType::INPUT_ATTACHMENT,
    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
];

/// A descriptor set layout mapping binding indices to descriptor types,
/// shader stages and counts. Immutable after build.
pub struct DescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    bindings: HashMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
    device: Arc<DeviceShared>,
}

impl DescriptorSetLayout {
    pub(crate) fn bindings(&self) -> &HashMap<u32, vk::DescriptorSetLayoutBinding<'static>> {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

/// Fluent builder for descriptor set layouts. Binding indices are unique;
/// re-adding an index replaces the previous binding.
pub struct DescriptorSetLayoutBuilder {
    flags: vk::DescriptorSetLayoutCreateFlags,
    bindings: HashMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings: HashMap::new(),
        }
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.bindings.insert(
            binding,
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .stage_flags(stage_flags)
                .descriptor_count(count),
        );
        self
    }

    pub fn flags(mut self, flags: vk::DescriptorSetLayoutCreateFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn build(self, ctx: &RenderContext) -> Result<DescriptorSetLayout> {
        let vulkan_bindings = self.bindings.values().copied().collect::<Vec<_>>();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vulkan_bindings)
            .flags(self.flags);

        let raw = unsafe {
            ctx.shared
                .raw
                .create_descriptor_set_layout(&create_info, None)?
        };

        Ok(DescriptorSetLayout {
            raw,
            bindings: self.bindings,
            device: ctx.shared.clone(),
        })
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool-backed descriptor set allocator. Every pool is pre-sized for all
/// descriptor types; when a pool runs out a fresh pool is created and the
/// allocation retried once before the error surfaces.
pub struct DescriptorSetAllocator {
    pools: Vec<vk::DescriptorPool>,
    set_pools: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
    per_type_capacity: u32,
    device: Arc<DeviceShared>,
}

impl DescriptorSetAllocator {
    pub fn new(ctx: &RenderContext) -> Result<Self> {
        Self::with_capacity(ctx, DEFAULT_DESCRIPTOR_POOL_PER_TYPE_CAPACITY)
    }

    pub fn with_capacity(ctx: &RenderContext, per_type_capacity: u32) -> Result<Self> {
        let device = ctx.shared.clone();
        let pool = Self::create_pool(&device, per_type_capacity)?;

        Ok(Self {
            pools: vec![pool],
            set_pools: HashMap::new(),
            per_type_capacity,
            device,
        })
    }

    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let pool = *self.pools.last().unwrap();
        match self.try_allocate(pool, layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                log::debug!("Descriptor pool exhausted, allocating a new pool");
                let pool = Self::create_pool(&self.device, self.per_type_capacity)?;
                self.pools.push(pool);

                let set = self.try_allocate(pool, layout)?;
                Ok(set)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn free(&mut self, set: vk::DescriptorSet) -> Result<()> {
        let pool = self
            .set_pools
            .remove(&set)
            .ok_or_else(|| anyhow::anyhow!("Descriptor set was not allocated by this allocator"))?;
        unsafe {
            self.device.raw.free_descriptor_sets(pool, &[set])?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        for pool in &self.pools {
            unsafe {
                self.device
                    .raw
                    .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())?;
            }
        }
        self.set_pools.clear();
        Ok(())
    }

    fn try_allocate(
        &mut self,
        pool: vk::DescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&layout.raw));
        let set = unsafe { self.device.raw.allocate_descriptor_sets(&allocate_info)?[0] };
        self.set_pools.insert(set, pool);
        Ok(set)
    }

    fn create_pool(
        device: &Arc<DeviceShared>,
        per_type_capacity: u32,
    ) -> Result<vk::DescriptorPool> {
        let pool_sizes = POOL_DESCRIPTOR_TYPES
            .iter()
            .map(|&ty| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(per_type_capacity)
            })
            .collect::<Vec<_>>();

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(per_type_capacity * POOL_DESCRIPTOR_TYPES.len() as u32)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.raw.create_descriptor_pool(&create_info, None)? };
        Ok(pool)
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        unsafe {
            for pool in self.pools.drain(..) {
                self.device.raw.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PendingWrite {
    Buffer {
        binding: u32,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
    AccelerationStructure {
        binding: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    },
}

impl PendingWrite {
    fn binding(&self) -> u32 {
        match self {
            Self::Buffer { binding, .. }
            | Self::Image { binding, .. }
            | Self::AccelerationStructure { binding, .. } => *binding,
        }
    }
}

/// Queue of descriptor writes not yet applied to a set.
#[derive(Default)]
pub(crate) struct PendingWriteQueue {
    writes: Vec<PendingWrite>,
}

impl PendingWriteQueue {
    fn push(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    fn take(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.writes)
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Owns one descriptor set and accumulates typed writes against it; `flush`
/// applies all pending writes atomically and clears the queue.
pub struct DescriptorSetManager {
    pub(crate) set: vk::DescriptorSet,
    bindings: HashMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
    pending: PendingWriteQueue,
    device: Arc<DeviceShared>,
}

impl DescriptorSetManager {
    pub fn new(
        ctx: &RenderContext,
        allocator: &mut DescriptorSetAllocator,
        layout: &DescriptorSetLayout,
    ) -> Result<Self> {
        let set = allocator.allocate(layout)?;

        Ok(Self {
            set,
            bindings: layout.bindings().clone(),
            pending: PendingWriteQueue::default(),
            device: ctx.shared.clone(),
        })
    }

    /// One manager per frame slot. A set is only rewritten for the slot
    /// whose fence has signaled, so in-flight frames never observe updates
    /// to descriptors they reference.
    pub fn new_per_frame(
        ctx: &RenderContext,
        allocator: &mut DescriptorSetAllocator,
        layout: &DescriptorSetLayout,
    ) -> Result<Vec<Self>> {
        (0..crate::frame::FRAMES_IN_FLIGHT)
            .map(|_| Self::new(ctx, allocator, layout))
            .collect()
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn write_buffer(&mut self, binding: u32, info: vk::DescriptorBufferInfo) -> &mut Self {
        self.pending.push(PendingWrite::Buffer { binding, info });
        self
    }

    pub fn write_image(&mut self, binding: u32, info: vk::DescriptorImageInfo) -> &mut Self {
        self.pending.push(PendingWrite::Image { binding, info });
        self
    }

    pub fn write_acceleration_structure(
        &mut self,
        binding: u32,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> &mut Self {
        self.pending.push(PendingWrite::AccelerationStructure {
            binding,
            acceleration_structure,
        });
        self
    }

    /// Applies all pending writes in a single descriptor update. A flush with
    /// no pending writes is a no-op.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let writes = self.pending.take();
        for write in &writes {
            if !self.bindings.contains_key(&write.binding()) {
                return Err(anyhow::anyhow!(
                    "Binding index {} is not part of the descriptor set layout",
                    write.binding()
                ));
            }
        }

        // The info structs referenced by each write must stay alive until the
        // update call; collect them up front so the vectors never reallocate
        // while pointers into them exist.
        let buffer_infos = writes
            .iter()
            .filter_map(|write| match write {
                PendingWrite::Buffer { info, .. } => Some(*info),
                _ => None,
            })
            .collect::<Vec<_>>();
        let image_infos = writes
            .iter()
            .filter_map(|write| match write {
                PendingWrite::Image { info, .. } => Some(*info),
                _ => None,
            })
            .collect::<Vec<_>>();
        let acceleration_structures = writes
            .iter()
            .filter_map(|write| match write {
                PendingWrite::AccelerationStructure {
                    acceleration_structure,
                    ..
                } => Some(*acceleration_structure),
                _ => None,
            })
            .collect::<Vec<_>>();

        let mut acceleration_structure_infos = acceleration_structures
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            })
            .collect::<Vec<_>>();

        let mut vulkan_writes = Vec::with_capacity(writes.len());
        let mut acceleration_structure_info_iter = acceleration_structure_infos.iter_mut();
        let (mut buffer_index, mut image_index) = (0usize, 0usize);
        for write in &writes {
            let binding = self.bindings[&write.binding()];
            let vulkan_write = vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(binding.binding)
                .dst_array_element(0)
                .descriptor_type(binding.descriptor_type);

            let vulkan_write = match write {
                PendingWrite::Buffer { .. } => {
                    let info = &buffer_infos[buffer_index];
                    buffer_index += 1;
                    vulkan_write.buffer_info(std::slice::from_ref(info))
                }
                PendingWrite::Image { .. } => {
                    let info = &image_infos[image_index];
                    image_index += 1;
                    vulkan_write.image_info(std::slice::from_ref(info))
                }
                PendingWrite::AccelerationStructure { .. } => {
                    let info = acceleration_structure_info_iter.next().unwrap();
                    vulkan_write.push_next(info).descriptor_count(1)
                }
            };

            vulkan_writes.push(vulkan_write);
        }

        unsafe {
            self.device.raw.update_descriptor_sets(&vulkan_writes, &[]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_write(binding: u32) -> PendingWrite {
        PendingWrite::Buffer {
            binding,
            info: vk::DescriptorBufferInfo::default(),
        }
    }

    #[test]
    fn test_pending_queue_take_clears() {
        let mut queue = PendingWriteQueue::default();
        queue.push(buffer_write(0));
        queue.push(buffer_write(1));

        let first = queue.take();
        assert_eq!(first.len(), 2);

        // A second flush with nothing new pending produces no writes.
        assert!(queue.is_empty());
        assert!(queue.take().is_empty());
    }

    #[test]
    fn test_pending_queue_preserves_order() {
        let mut queue = PendingWriteQueue::default();
        queue.push(buffer_write(2));
        queue.push(PendingWrite::AccelerationStructure {
            binding: 0,
            acceleration_structure: vk::AccelerationStructureKHR::null(),
        });
        queue.push(buffer_write(1));

        let writes = queue.take();
        let bindings = writes.iter().map(PendingWrite::binding).collect::<Vec<_>>();
        assert_eq!(bindings, vec![2, 0, 1]);
    }
}
