/*! GPU resource primitives: buffers, images and samplers. Each wrapper owns
 * its allocation and releases it on drop; wrappers are move-only.
 */

use std::{
    mem::{align_of, size_of_val},
    sync::Arc,
};

use anyhow::Result;
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use crate::context::{DeviceShared, RenderContext};

pub struct BufferResourceDescriptor {
    pub size: vk::DeviceSize,
    pub usage_flags: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
}

impl BufferResourceDescriptor {
    pub fn new(
        size: vk::DeviceSize,
        usage_flags: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
    ) -> Self {
        Self {
            size,
            usage_flags,
            memory_location,
        }
    }
}

/// Exclusively owned GPU buffer with its backing allocation.
pub struct BufferResource {
    pub(crate) raw: vk::Buffer,
    size: vk::DeviceSize,
    host_visible: bool,
    allocation: Option<Allocation>,
    device: Arc<DeviceShared>,
}

impl BufferResource {
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn host_visible(&self) -> bool {
        self.host_visible
    }

    pub(crate) fn raw(&self) -> vk::Buffer {
        self.raw
    }

    /// Copies `data` into the buffer at a value offset measured in elements
    /// of `T`. The write must fit in `size - byte_offset` and the buffer must
    /// be host visible.
    pub fn copy_to_buffer<T: Copy>(&self, data: &[T], value_offset: u64) -> Result<()> {
        let byte_offset = value_offset * std::mem::size_of::<T>() as u64;
        let byte_count = size_of_val(data) as u64;

        if !self.host_visible {
            return Err(anyhow::anyhow!(
                "Cannot copy to device-local buffer from the host"
            ));
        }
        if byte_count > self.size - byte_offset.min(self.size) {
            return Err(anyhow::anyhow!(
                "Buffer copy of {} bytes at offset {} overruns buffer of {} bytes",
                byte_count,
                byte_offset,
                self.size
            ));
        }

        unsafe {
            let data_ptr = self
                .allocation
                .as_ref()
                .unwrap()
                .mapped_ptr()
                .unwrap()
                .as_ptr()
                .add(byte_offset as usize);

            let mut align = ash::util::Align::new(data_ptr, align_of::<T>() as _, byte_count);
            align.copy_from_slice(data);
        };

        Ok(())
    }

    /// Queries the buffer device address. Only valid for buffers created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.raw);
        unsafe { self.device.raw.get_buffer_device_address(&info) }
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_buffer(self.raw, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
    }
}

pub struct ImageResourceDescriptor {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub extent: vk::Extent3D,
    pub mip_level_count: u32,
    pub array_layer_count: u32,
    pub usage_flags: vk::ImageUsageFlags,
}

impl ImageResourceDescriptor {
    pub fn new_2d(extent: vk::Extent2D, format: vk::Format, usage_flags: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_level_count: 1,
            array_layer_count: 1,
            usage_flags,
        }
    }
}

/// Exclusively owned GPU image with an optional view. Creating a new view
/// destroys the previous one.
pub struct ImageResource {
    pub(crate) raw: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    device: Arc<DeviceShared>,
}

impl ImageResource {
    pub fn default_component_mapping() -> vk::ComponentMapping {
        vk::ComponentMapping::default()
            .r(vk::ComponentSwizzle::IDENTITY)
            .g(vk::ComponentSwizzle::IDENTITY)
            .b(vk::ComponentSwizzle::IDENTITY)
            .a(vk::ComponentSwizzle::IDENTITY)
    }

    pub fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1)
    }

    /// Creates a view over the image, destroying any previously created view.
    pub fn create_view(
        &mut self,
        view_type: vk::ImageViewType,
        components: vk::ComponentMapping,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Result<()> {
        self.destroy_view();

        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(self.raw)
            .view_type(view_type)
            .format(self.format)
            .components(components)
            .subresource_range(subresource_range);
        self.view = unsafe { self.device.raw.create_image_view(&view_create_info, None)? };

        Ok(())
    }

    /// The current view handle; null until `create_view` has been called.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub(crate) fn raw(&self) -> vk::Image {
        self.raw
    }

    fn destroy_view(&mut self) {
        if self.view != vk::ImageView::null() {
            unsafe {
                self.device.raw.destroy_image_view(self.view, None);
            }
            self.view = vk::ImageView::null();
        }
    }
}

impl Drop for ImageResource {
    fn drop(&mut self) {
        self.destroy_view();
        unsafe {
            self.device.raw.destroy_image(self.raw, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
    }
}

pub struct ImageSamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl ImageSamplerDescriptor {
    pub fn new(min_filter: vk::Filter, mag_filter: vk::Filter, mipmap_mode: vk::SamplerMipmapMode) -> Self {
        Self {
            min_filter,
            mag_filter,
            mipmap_mode,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            max_anisotropy: None,
            compare_op: None,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            unnormalized_coordinates: false,
        }
    }

    pub fn address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }

    pub fn lod_clamp(mut self, min_lod: f32, max_lod: f32) -> Self {
        self.min_lod = min_lod;
        self.max_lod = max_lod;
        self
    }

    pub fn max_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy = Some(max_anisotropy);
        self
    }

    pub fn compare_op(mut self, compare_op: vk::CompareOp) -> Self {
        self.compare_op = Some(compare_op);
        self
    }

    pub fn border_color(mut self, border_color: vk::BorderColor) -> Self {
        self.border_color = border_color;
        self
    }

    pub fn unnormalized_coordinates(mut self, unnormalized: bool) -> Self {
        self.unnormalized_coordinates = unnormalized;
        self
    }
}

/// Immutable sampler object.
pub struct ImageSampler {
    pub(crate) raw: vk::Sampler,
    device: Arc<DeviceShared>,
}

impl ImageSampler {
    pub(crate) fn raw(&self) -> vk::Sampler {
        self.raw
    }
}

impl Drop for ImageSampler {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_sampler(self.raw, None);
        }
    }
}

impl RenderContext {
    pub fn create_buffer(&self, desc: BufferResourceDescriptor) -> Result<BufferResource> {
        debug_assert!(desc.size > 0, "Buffer size must be non-zero");

        // Buffers may be filled on the transfer queue and consumed on the
        // graphics queue; share them concurrently when the families differ.
        let queue_family_indices = {
            let mut indices = vec![
                self.queues.graphics.family_index,
                self.queues.transfer.family_index,
            ];
            indices.sort();
            indices.dedup();
            indices
        };

        let mut create_info = vk::BufferCreateInfo::default().size(desc.size).usage(
            desc.usage_flags
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        );
        if queue_family_indices.len() > 1 {
            create_info = create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices);
        }

        let raw;
        let requirements;
        unsafe {
            raw = self.shared.raw.create_buffer(&create_info, None)?;
            requirements = self.shared.raw.get_buffer_memory_requirements(raw);
        }

        let allocation = self.shared.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: desc.memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            self.shared
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok(BufferResource {
            raw,
            size: desc.size,
            host_visible: !matches!(desc.memory_location, MemoryLocation::GpuOnly),
            allocation: Some(allocation),
            device: self.shared.clone(),
        })
    }

    pub fn create_image(&self, desc: ImageResourceDescriptor) -> Result<ImageResource> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_level_count)
            .array_layers(desc.array_layer_count)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.shared.raw.create_image(&create_info, None)? };
        let requirements = unsafe { self.shared.raw.get_image_memory_requirements(raw) };

        let allocation = self.shared.allocator.lock().allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            self.shared
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        };

        Ok(ImageResource {
            raw,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            extent: desc.extent,
            format: desc.format,
            device: self.shared.clone(),
        })
    }

    /// Creates a device-local buffer and fills it with `data` through a
    /// staging copy submitted on the transfer queue.
    pub fn create_device_local_buffer<T: Copy>(
        &self,
        usage_flags: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<BufferResource> {
        let size = size_of_val(data) as vk::DeviceSize;

        let staging_buffer = self.create_buffer(BufferResourceDescriptor::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ))?;
        staging_buffer.copy_to_buffer(data, 0)?;

        let buffer = self.create_buffer(BufferResourceDescriptor::new(
            size,
            usage_flags,
            MemoryLocation::GpuOnly,
        ))?;

        let region = vk::BufferCopy::default().size(size);
        let device = self.device().clone();
        self.execute_one_shot_transfer(|command_buffer| unsafe {
            device.cmd_copy_buffer(
                command_buffer,
                staging_buffer.raw,
                buffer.raw,
                std::slice::from_ref(&region),
            );
        })?;

        Ok(buffer)
    }

    pub fn create_sampler(&self, desc: ImageSamplerDescriptor) -> Result<ImageSampler> {
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates);

        let raw = unsafe { self.shared.raw.create_sampler(&create_info, None)? };

        Ok(ImageSampler {
            raw,
            device: self.shared.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_descriptor_fluent_state() {
        let desc = ImageSamplerDescriptor::new(
            vk::Filter::NEAREST,
            vk::Filter::NEAREST,
            vk::SamplerMipmapMode::NEAREST,
        )
        .address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .lod_clamp(0.0, 4.0)
        .max_anisotropy(8.0)
        .compare_op(vk::CompareOp::LESS);

        assert_eq!(desc.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(desc.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(desc.max_lod, 4.0);
        assert_eq!(desc.max_anisotropy, Some(8.0));
        assert_eq!(desc.compare_op, Some(vk::CompareOp::LESS));
        assert!(!desc.unnormalized_coordinates);
    }

    #[test]
    fn test_subresource_range_defaults() {
        let range = ImageResource::subresource_range(vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.base_mip_level, 0);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.layer_count, 1);
    }
}
