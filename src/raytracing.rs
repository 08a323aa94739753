/*! Hardware ray tracing support: extension dispatch tables, the ray tracing
 * pipeline builder, shader binding tables and acceleration structures.
 */

use anyhow::Result;
use ash::{khr, vk};
use nalgebra::Matrix4;

use crate::{
    context::RenderContext,
    resource::{BufferResource, BufferResourceDescriptor},
    scene::Mesh,
};
use gpu_allocator::MemoryLocation;

/// Default bound for TraceRays recursion.
pub const DEFAULT_RT_RECURSION_DEPTH: u32 = 2;

/// Ray tracing pipeline limits relevant for SBT construction.
#[derive(Debug, Clone, Copy)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Bundles the extension dispatch tables required for ray tracing work, plus
/// the pipeline properties needed to lay out shader binding tables.
pub struct RayTracingContext {
    pub(crate) acceleration_structure: khr::acceleration_structure::Device,
    pub(crate) ray_tracing_pipeline: khr::ray_tracing_pipeline::Device,
    pub(crate) deferred_host_operations: khr::deferred_host_operations::Device,
    pub properties: RayTracingProperties,
}

impl RayTracingContext {
    pub fn new(ctx: &RenderContext) -> Self {
        let instance = &ctx.shared.instance.raw;
        let device = &ctx.shared.raw;

        let mut ray_tracing_properties =
            vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut ray_tracing_properties);
        unsafe {
            instance.get_physical_device_properties2(
                ctx.shared.physical_device.raw,
                &mut properties2,
            );
        }

        Self {
            acceleration_structure: khr::acceleration_structure::Device::new(instance, device),
            ray_tracing_pipeline: khr::ray_tracing_pipeline::Device::new(instance, device),
            deferred_host_operations: khr::deferred_host_operations::Device::new(instance, device),
            properties: RayTracingProperties {
                shader_group_handle_size: ray_tracing_properties.shader_group_handle_size,
                shader_group_handle_alignment: ray_tracing_properties
                    .shader_group_handle_alignment,
                shader_group_base_alignment: ray_tracing_properties.shader_group_base_alignment,
                max_ray_recursion_depth: ray_tracing_properties.max_ray_recursion_depth,
            },
        }
    }

    /// Creates a deferred operation handle for postponing expensive pipeline
    /// builds to a host operation.
    pub fn create_deferred_operation(&self) -> Result<vk::DeferredOperationKHR> {
        let operation = unsafe {
            self.deferred_host_operations
                .create_deferred_operation(None)?
        };
        Ok(operation)
    }

    pub fn destroy_deferred_operation(&self, operation: vk::DeferredOperationKHR) {
        unsafe {
            self.deferred_host_operations
                .destroy_deferred_operation(operation, None);
        }
    }

    /// Dispatches TraceRays over a 2D extent.
    pub fn cmd_trace_rays(
        &self,
        command_buffer: vk::CommandBuffer,
        sbt: &ShaderBindingTable,
        extent: vk::Extent2D,
    ) {
        unsafe {
            self.ray_tracing_pipeline.cmd_trace_rays(
                command_buffer,
                &sbt.region(ShaderGroupKind::RayGen),
                &sbt.region(ShaderGroupKind::Miss),
                &sbt.region(ShaderGroupKind::Hit),
                &sbt.region(ShaderGroupKind::Call),
                extent.width,
                extent.height,
                1,
            );
        }
    }
}

/// Shader group kinds keying the SBT regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroupKind {
    RayGen,
    Miss,
    Hit,
    Call,
}

/// Number of shader groups per kind in a ray tracing pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub call: u32,
}

impl ShaderGroupCounts {
    fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.call
    }
}

/// Accumulates shader stages and shader groups for a ray tracing pipeline.
/// Groups reference stages by the index in which they were added.
pub struct RayTracingPipelineBuilder {
    flags: vk::PipelineCreateFlags,
    shader_stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    shader_groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>,
    max_recursion_depth: u32,
    layout: vk::PipelineLayout,
}

impl RayTracingPipelineBuilder {
    pub fn new() -> Self {
        Self {
            flags: vk::PipelineCreateFlags::empty(),
            shader_stages: Vec::new(),
            shader_groups: Vec::new(),
            max_recursion_depth: DEFAULT_RT_RECURSION_DEPTH,
            layout: vk::PipelineLayout::null(),
        }
    }

    pub fn add_shader_stage(mut self, stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        self.shader_stages.push((stage, module));
        self
    }

    /// Adds a general shader group (ray generation, miss or callable).
    pub fn add_general_group(self, general_shader: u32) -> Self {
        self.add_shader_group(
            vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general_shader,
            vk::SHADER_UNUSED_KHR,
            vk::SHADER_UNUSED_KHR,
            vk::SHADER_UNUSED_KHR,
        )
    }

    /// Adds a triangle hit group.
    pub fn add_triangles_hit_group(self, closest_hit_shader: u32, any_hit_shader: u32) -> Self {
        self.add_shader_group(
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            vk::SHADER_UNUSED_KHR,
            closest_hit_shader,
            any_hit_shader,
            vk::SHADER_UNUSED_KHR,
        )
    }

    /// Adds a procedural hit group with an intersection shader.
    pub fn add_procedural_hit_group(
        self,
        intersection_shader: u32,
        closest_hit_shader: u32,
        any_hit_shader: u32,
    ) -> Self {
        self.add_shader_group(
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            vk::SHADER_UNUSED_KHR,
            closest_hit_shader,
            any_hit_shader,
            intersection_shader,
        )
    }

    pub fn add_shader_group(
        mut self,
        group_type: vk::RayTracingShaderGroupTypeKHR,
        general_shader: u32,
        closest_hit_shader: u32,
        any_hit_shader: u32,
        intersection_shader: u32,
    ) -> Self {
        self.shader_groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(group_type)
                .general_shader(general_shader)
                .closest_hit_shader(closest_hit_shader)
                .any_hit_shader(any_hit_shader)
                .intersection_shader(intersection_shader),
        );
        self
    }

    pub fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn create_flags(mut self, flags: vk::PipelineCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Shader group counts per kind, derived from the group and stage lists.
    pub fn shader_group_counts(&self) -> ShaderGroupCounts {
        let mut counts = ShaderGroupCounts::default();
        for group in &self.shader_groups {
            match self.classify_group(group) {
                ShaderGroupKind::RayGen => counts.raygen += 1,
                ShaderGroupKind::Miss => counts.miss += 1,
                ShaderGroupKind::Hit => counts.hit += 1,
                ShaderGroupKind::Call => counts.call += 1,
            }
        }
        counts
    }

    pub(crate) fn shader_group_kinds(&self) -> Vec<ShaderGroupKind> {
        self.shader_groups
            .iter()
            .map(|group| self.classify_group(group))
            .collect()
    }

    fn classify_group(
        &self,
        group: &vk::RayTracingShaderGroupCreateInfoKHR<'static>,
    ) -> ShaderGroupKind {
        if group.ty != vk::RayTracingShaderGroupTypeKHR::GENERAL {
            return ShaderGroupKind::Hit;
        }
        let (stage, _) = self.shader_stages[group.general_shader as usize];
        if stage.contains(vk::ShaderStageFlags::RAYGEN_KHR) {
            ShaderGroupKind::RayGen
        } else if stage.contains(vk::ShaderStageFlags::MISS_KHR) {
            ShaderGroupKind::Miss
        } else {
            ShaderGroupKind::Call
        }
    }

    /// Builds the configured ray tracing pipeline.
    pub fn build(&self, rt: &RayTracingContext, cache: vk::PipelineCache) -> Result<vk::Pipeline> {
        self.build_with_deferred_operation(rt, cache, vk::DeferredOperationKHR::null())
    }

    /// Builds the pipeline, optionally deferring creation to a host
    /// operation handle.
    pub fn build_with_deferred_operation(
        &self,
        rt: &RayTracingContext,
        cache: vk::PipelineCache,
        deferred_operation: vk::DeferredOperationKHR,
    ) -> Result<vk::Pipeline> {
        let stages = self
            .shader_stages
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(c"main")
            })
            .collect::<Vec<_>>();

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .flags(self.flags)
            .stages(&stages)
            .groups(&self.shader_groups)
            .max_pipeline_ray_recursion_depth(
                self.max_recursion_depth
                    .min(rt.properties.max_ray_recursion_depth),
            )
            .layout(self.layout);

        let pipeline = unsafe {
            rt.ray_tracing_pipeline
                .create_ray_tracing_pipelines(
                    deferred_operation,
                    cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        Ok(pipeline)
    }
}

impl Default for RayTracingPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn aligned_size(size: u32, alignment: u32) -> u32 {
    (size + alignment - 1) & !(alignment - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SbtRegion {
    offset: u64,
    stride: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SbtLayout {
    raygen: SbtRegion,
    miss: SbtRegion,
    hit: SbtRegion,
    call: SbtRegion,
    total_size: u64,
}

impl SbtLayout {
    /// Lays out the SBT regions: each record is the group handle rounded up
    /// to the handle alignment, each region starts at the group base
    /// alignment, and the ray generation region's size equals its stride.
    fn compute(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        counts: ShaderGroupCounts,
    ) -> Result<Self> {
        if counts.raygen != 1 {
            return Err(anyhow::anyhow!(
                "Shader binding table requires exactly one ray generation group, got {}",
                counts.raygen
            ));
        }

        let stride = aligned_size(handle_size, handle_alignment) as u64;

        let mut offset = 0u64;
        let mut next_region = |count: u32, raygen: bool| {
            if count == 0 {
                return SbtRegion::default();
            }
            let region_offset = aligned_size(offset as u32, base_alignment) as u64;
            let size = if raygen { stride } else { stride * count as u64 };
            offset = region_offset + size;
            SbtRegion {
                offset: region_offset,
                stride,
                size,
            }
        };

        let raygen = next_region(counts.raygen, true);
        let miss = next_region(counts.miss, false);
        let hit = next_region(counts.hit, false);
        let call = next_region(counts.call, false);
        let total_size = offset;

        Ok(Self {
            raygen,
            miss,
            hit,
            call,
            total_size,
        })
    }

    fn region(&self, kind: ShaderGroupKind) -> SbtRegion {
        match kind {
            ShaderGroupKind::RayGen => self.raygen,
            ShaderGroupKind::Miss => self.miss,
            ShaderGroupKind::Hit => self.hit,
            ShaderGroupKind::Call => self.call,
        }
    }
}

/// A device buffer mapping ray tracing shader groups to the addresses used by
/// TraceRays, built once per ray tracing pipeline from its group handles.
pub struct ShaderBindingTable {
    buffer: BufferResource,
    layout: SbtLayout,
}

impl ShaderBindingTable {
    pub fn new(
        ctx: &RenderContext,
        rt: &RayTracingContext,
        pipeline: vk::Pipeline,
        pipeline_builder: &RayTracingPipelineBuilder,
    ) -> Result<Self> {
        let properties = &rt.properties;
        let counts = pipeline_builder.shader_group_counts();
        let layout = SbtLayout::compute(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            counts,
        )?;

        let group_kinds = pipeline_builder.shader_group_kinds();
        let handle_size = properties.shader_group_handle_size as usize;
        let handles = unsafe {
            rt.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                counts.total(),
                handle_size * counts.total() as usize,
            )?
        };

        // Scatter each group handle into the next record of its region.
        let mut table_data = vec![0u8; layout.total_size as usize];
        let mut region_slots = [0u64; 4];
        for (group_index, kind) in group_kinds.iter().enumerate() {
            let region = layout.region(*kind);
            let slot_index = match kind {
                ShaderGroupKind::RayGen => &mut region_slots[0],
                ShaderGroupKind::Miss => &mut region_slots[1],
                ShaderGroupKind::Hit => &mut region_slots[2],
                ShaderGroupKind::Call => &mut region_slots[3],
            };
            let dst_offset = (region.offset + *slot_index * region.stride) as usize;
            *slot_index += 1;

            let src_offset = group_index * handle_size;
            table_data[dst_offset..dst_offset + handle_size]
                .copy_from_slice(&handles[src_offset..src_offset + handle_size]);
        }

        let buffer = ctx.create_buffer(BufferResourceDescriptor::new(
            layout.total_size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ))?;
        buffer.copy_to_buffer(&table_data, 0)?;

        Ok(Self { buffer, layout })
    }

    /// The strided device address region for a shader group kind. Regions
    /// with no groups are empty.
    pub fn region(&self, kind: ShaderGroupKind) -> vk::StridedDeviceAddressRegionKHR {
        let region = self.layout.region(kind);
        if region.size == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }

        vk::StridedDeviceAddressRegionKHR::default()
            .device_address(self.buffer.device_address() + region.offset)
            .stride(region.stride)
            .size(region.size)
    }
}

/// Converts a column-major model matrix into the row-major 3x4 transform used
/// by acceleration structure instances.
pub fn instance_transform(model: &Matrix4<f32>) -> vk::TransformMatrixKHR {
    let mut matrix = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            matrix[row * 4 + col] = model[(row, col)];
        }
    }
    vk::TransformMatrixKHR { matrix }
}

/// An owned acceleration structure with its backing buffer. BLASes index mesh
/// geometry; the TLAS indexes instances and is rebuilt per frame.
pub struct AccelerationStructure {
    raw: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    _buffer: BufferResource,
    _instance_buffer: Option<BufferResource>,
    device: khr::acceleration_structure::Device,
}

impl AccelerationStructure {
    /// Builds a bottom-level acceleration structure over a mesh's triangle
    /// geometry.
    pub fn build_blas(ctx: &RenderContext, rt: &RayTracingContext, mesh: &Mesh) -> Result<Self> {
        let vertex_address = vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.vertex_buffer.device_address(),
        };
        let index_address = vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.index_buffer.device_address(),
        };

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vertex_address)
            .vertex_stride(std::mem::size_of::<crate::scene::Vertex>() as u64)
            .max_vertex(mesh.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(index_address);

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

        let primitive_count = mesh.index_count / 3;
        Self::build(
            ctx,
            rt,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            primitive_count,
            None,
        )
    }

    /// Builds a top-level acceleration structure over instance records. The
    /// instance buffer stays alive with the structure.
    pub fn build_tlas(
        ctx: &RenderContext,
        rt: &RayTracingContext,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<Self> {
        let instance_buffer = ctx.create_buffer(BufferResourceDescriptor::new(
            (std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() * instances.len().max(1))
                as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ))?;
        if !instances.is_empty() {
            instance_buffer.copy_to_buffer(instances, 0)?;
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address(),
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });

        Self::build(
            ctx,
            rt,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            instances.len() as u32,
            Some(instance_buffer),
        )
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    fn build(
        ctx: &RenderContext,
        rt: &RayTracingContext,
        structure_type: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
        instance_buffer: Option<BufferResource>,
    ) -> Result<Self> {
        let geometries = [geometry];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(structure_type)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            rt.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut size_info,
            );
        }

        let buffer = ctx.create_buffer(BufferResourceDescriptor::new(
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        ))?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.raw())
            .size(size_info.acceleration_structure_size)
            .ty(structure_type);
        let raw = unsafe {
            rt.acceleration_structure
                .create_acceleration_structure(&create_info, None)?
        };

        let scratch_buffer = ctx.create_buffer(BufferResourceDescriptor::new(
            size_info.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        ))?;

        build_info = build_info
            .dst_acceleration_structure(raw)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer.device_address(),
            });

        let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count);

        ctx.execute_one_shot_graphics(|command_buffer| unsafe {
            rt.acceleration_structure.cmd_build_acceleration_structures(
                command_buffer,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range_info)],
            );
        })?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(raw);
        let device_address = unsafe {
            rt.acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(Self {
            raw,
            device_address,
            _buffer: buffer,
            _instance_buffer: instance_buffer,
            device: rt.acceleration_structure.clone(),
        })
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_acceleration_structure(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(32, 64), 64);
        assert_eq!(aligned_size(64, 64), 64);
        assert_eq!(aligned_size(65, 64), 128);
        assert_eq!(aligned_size(0, 64), 0);
    }

    #[test]
    fn test_sbt_layout_regions() {
        // Typical desktop limits: 32 byte handles, 32/64 byte alignments.
        let layout = SbtLayout::compute(
            32,
            32,
            64,
            ShaderGroupCounts {
                raygen: 1,
                miss: 2,
                hit: 1,
                call: 0,
            },
        )
        .unwrap();

        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 32, size: 32 });
        // Regions start at the group base alignment.
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 32 });
        // No callable groups: empty region.
        assert_eq!(layout.call, SbtRegion::default());
        assert_eq!(layout.total_size, 160);
    }

    #[test]
    fn test_sbt_layout_requires_one_raygen_group() {
        let no_raygen = SbtLayout::compute(32, 32, 64, ShaderGroupCounts::default());
        assert!(no_raygen.is_err());

        let two_raygen = SbtLayout::compute(
            32,
            32,
            64,
            ShaderGroupCounts {
                raygen: 2,
                miss: 1,
                hit: 1,
                call: 0,
            },
        );
        assert!(two_raygen.is_err());
    }

    #[test]
    fn test_sbt_layout_oversized_handles() {
        // Handle alignment larger than the handle pads every record.
        let layout = SbtLayout::compute(
            32,
            64,
            64,
            ShaderGroupCounts {
                raygen: 1,
                miss: 1,
                hit: 2,
                call: 1,
            },
        )
        .unwrap();

        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.raygen.size, 64);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.hit.size, 128);
        assert_eq!(layout.call.offset, 256);
        assert_eq!(layout.total_size, 320);
    }

    #[test]
    fn test_instance_transform_layout() {
        let translation = Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0));
        let transform = instance_transform(&translation);

        // Row-major 3x4: translation lands in the last column of each row.
        assert_eq!(transform.matrix[0], 1.0);
        assert_eq!(transform.matrix[3], 1.0);
        assert_eq!(transform.matrix[5], 1.0);
        assert_eq!(transform.matrix[7], 2.0);
        assert_eq!(transform.matrix[10], 1.0);
        assert_eq!(transform.matrix[11], 3.0);
    }
}
