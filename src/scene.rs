/*! The scene slice touched by the render core: meshes, materials, render
 * instances with LOD selection masks, and the GPU payload layouts for the
 * instance and material storage buffers.
 */

use anyhow::Result;
use ash::vk;
use nalgebra::{Matrix4, Vector2, Vector3};

use crate::{context::RenderContext, resource::BufferResource};

/// Bits of the LOD selection mask consulted by the G-buffer shaders.
pub const LOD_MASK_BITS: u32 = 8;
pub const VALID_LOD_MASK: u32 = (1 << LOD_MASK_BITS) - 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub tangent: Vector3<f32>,
    pub tex_coord: Vector2<f32>,
}

impl Vertex {
    pub fn input_bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    pub fn input_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, position) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, normal) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, tangent) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(3)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, tex_coord) as u32),
        ]
    }
}

/// A renderable mesh with uploaded vertex and index buffers. Buffers carry
/// acceleration-structure build usage so BLAS construction can read them.
pub struct Mesh {
    pub vertex_buffer: BufferResource,
    pub index_buffer: BufferResource,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl Mesh {
    pub fn new(ctx: &RenderContext, vertices: &[Vertex], indices: &[u32]) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(anyhow::anyhow!("Mesh requires vertices and indices"));
        }

        let geometry_usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::STORAGE_BUFFER;

        let vertex_buffer = ctx
            .create_device_local_buffer(vk::BufferUsageFlags::VERTEX_BUFFER | geometry_usage, vertices)?;
        let index_buffer = ctx
            .create_device_local_buffer(vk::BufferUsageFlags::INDEX_BUFFER | geometry_usage, indices)?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }
}

/// Drawing parameters for renderable objects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub diffuse: Vector3<f32>,
    pub specular: Vector3<f32>,
    pub transmittance: Vector3<f32>,
    pub emission: Vector3<f32>,
    pub shininess: f32,
    pub ior: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: Vector3::new(0.8, 0.8, 0.8),
            specular: Vector3::new(0.5, 0.5, 0.5),
            transmittance: Vector3::new(0.0, 0.0, 0.0),
            emission: Vector3::new(0.0, 0.0, 0.0),
            shininess: 1.0,
            ior: 1.45,
        }
    }
}

/// std430 layout of a material record in the material SSBO.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialShaderData {
    pub diffuse: Vector3<f32>,
    pub shininess: f32,
    pub specular: Vector3<f32>,
    pub ior: f32,
    pub transmittance: Vector3<f32>,
    _padding0: f32,
    pub emission: Vector3<f32>,
    _padding1: f32,
}

impl From<&Material> for MaterialShaderData {
    fn from(material: &Material) -> Self {
        Self {
            diffuse: material.diffuse,
            shininess: material.shininess,
            specular: material.specular,
            ior: material.ior,
            transmittance: material.transmittance,
            _padding0: 0.0,
            emission: material.emission,
            _padding1: 0.0,
        }
    }
}

/// A renderable object instance referencing one mesh per LOD level.
#[derive(Debug, Clone, Copy)]
pub struct RenderInstance {
    pub model_matrix: Matrix4<f32>,
    /// Mesh index drawn by the near-LOD G-buffer pass.
    pub mesh_lod_near: u32,
    /// Mesh index drawn by the far-LOD G-buffer pass.
    pub mesh_lod_far: u32,
    pub material_index: u32,
    /// Share of screen samples resolved from the far LOD, in `[0, 1]`.
    pub lod_blend: f32,
}

/// Generates the LOD selection mask for an instance: the low bits of an
/// 8-bit mask are set in proportion to the far-LOD blend share. Bits that
/// are set select the far LOD; the near pass uses the complement.
pub fn lod_mask(lod_blend: f32) -> u32 {
    let set_bits = (lod_blend.clamp(0.0, 1.0) * LOD_MASK_BITS as f32).round() as u32;
    if set_bits == 0 {
        0
    } else {
        (1u32 << set_bits.min(LOD_MASK_BITS)) - 1
    }
}

/// std430 layout of an instance record in the instance data SSBO.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceShaderData {
    pub model: Matrix4<f32>,
    /// Inverse transpose of the model matrix, for normal transformation.
    pub normal: Matrix4<f32>,
    pub material_index: u32,
    pub lod_mask: u32,
    _padding: [u32; 2],
}

/// The renderable world as the core sees it: flat mesh, material and
/// instance lists.
pub struct SceneGraph {
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub instances: Vec<RenderInstance>,
}

impl SceneGraph {
    pub fn new(
        meshes: Vec<Mesh>,
        materials: Vec<Material>,
        instances: Vec<RenderInstance>,
    ) -> Self {
        Self {
            meshes,
            materials,
            instances,
        }
    }

    /// Instance records for the instance data SSBO.
    pub fn instance_shader_data(&self) -> Vec<InstanceShaderData> {
        self.instances
            .iter()
            .map(|instance| InstanceShaderData {
                model: instance.model_matrix,
                normal: instance
                    .model_matrix
                    .try_inverse()
                    .unwrap_or_else(Matrix4::identity)
                    .transpose(),
                material_index: instance.material_index,
                lod_mask: lod_mask(instance.lod_blend),
                _padding: [0; 2],
            })
            .collect()
    }

    /// Material records for the material SSBO.
    pub fn material_shader_data(&self) -> Vec<MaterialShaderData> {
        self.materials.iter().map(MaterialShaderData::from).collect()
    }

    pub fn instance_buffer_size(&self) -> u64 {
        (std::mem::size_of::<InstanceShaderData>() * self.instances.len().max(1)) as u64
    }

    pub fn material_buffer_size(&self) -> u64 {
        (std::mem::size_of::<MaterialShaderData>() * self.materials.len().max(1)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lod_mask_extremes() {
        assert_eq!(lod_mask(0.0), 0);
        assert_eq!(lod_mask(1.0), VALID_LOD_MASK);
        assert_eq!(lod_mask(-1.0), 0);
        assert_eq!(lod_mask(2.0), VALID_LOD_MASK);
    }

    #[test]
    fn test_lod_mask_complement_partitions_samples() {
        for step in 0..=8 {
            let blend = step as f32 / 8.0;
            let far = lod_mask(blend) & VALID_LOD_MASK;
            let near = (!lod_mask(blend)) & VALID_LOD_MASK;

            // Far and near masks are disjoint and together cover every
            // sample bit, so each pixel sample resolves exactly one LOD.
            assert_eq!(far & near, 0);
            assert_eq!(far | near, VALID_LOD_MASK);
            assert_eq!(far.count_ones(), step);
        }
    }

    #[test]
    fn test_lod_mask_is_monotonic() {
        let mut previous = 0;
        for step in 0..=8 {
            let mask = lod_mask(step as f32 / 8.0);
            assert!(mask >= previous);
            previous = mask;
        }
    }

    #[test]
    fn test_vertex_attribute_offsets_match_layout() {
        let attributes = Vertex::input_attributes();
        assert_eq!(attributes.len(), 4);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(attributes[3].offset, 36);
        assert_eq!(Vertex::input_bindings()[0].stride, 44);
    }

    #[test]
    fn test_instance_shader_data_identity_normal_matrix() {
        let scene = SceneGraph::new(
            vec![],
            vec![Material::default()],
            vec![RenderInstance {
                model_matrix: Matrix4::identity(),
                mesh_lod_near: 0,
                mesh_lod_far: 0,
                material_index: 0,
                lod_blend: 0.5,
            }],
        );

        let data = scene.instance_shader_data();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].normal, Matrix4::identity());
        assert_eq!(data[0].lod_mask, lod_mask(0.5));
    }
}
