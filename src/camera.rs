/*! Virtual camera and its shader-ready data layout. */

use nalgebra::{Matrix4, Perspective3, Point3, Vector3};

pub fn world_forward() -> Vector3<f32> {
    Vector3::new(0.0, 0.0, 1.0)
}

pub fn world_up() -> Vector3<f32> {
    Vector3::new(0.0, 1.0, 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraParameters {
    pub fov_y_degrees: f32,
    pub aspect_ratio: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            fov_y_degrees: 60.0,
            aspect_ratio: 16.0 / 9.0,
            z_near: 0.01,
            z_far: 1000.0,
        }
    }
}

/// Shader layout of camera data, uploaded into the per-frame camera UBOs.
/// Inverse matrices are included for ray generation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraShaderData {
    pub position: Vector3<f32>,
    _padding: f32,
    pub view: Matrix4<f32>,
    pub project: Matrix4<f32>,
    pub view_inverse: Matrix4<f32>,
    pub project_inverse: Matrix4<f32>,
}

/// A virtual camera used in rendering operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub parameters: CameraParameters,
    pub position: Point3<f32>,
    pub forward: Vector3<f32>,
    pub up: Vector3<f32>,
    view: Matrix4<f32>,
    project: Matrix4<f32>,
}

impl Camera {
    /// Creates a camera at `position` looking towards `target`. The target
    /// must not be directly above or below the position.
    pub fn new(parameters: CameraParameters, position: Point3<f32>, target: Point3<f32>) -> Self {
        let forward = (target - position).normalize();
        let right = world_up().cross(&forward).normalize();
        let up = forward.cross(&right).normalize();

        let mut camera = Self {
            parameters,
            position,
            forward,
            up,
            view: Matrix4::identity(),
            project: Matrix4::identity(),
        };
        camera.update_matrices();
        camera
    }

    /// Recomputes view and projection matrices from position, orientation and
    /// lens parameters. Call after mutating any of them.
    pub fn update_matrices(&mut self) {
        self.view = Matrix4::look_at_rh(
            &self.position,
            &(self.position + self.forward),
            &self.up,
        );

        self.project = Perspective3::new(
            self.parameters.aspect_ratio,
            self.parameters.fov_y_degrees.to_radians(),
            self.parameters.z_near,
            self.parameters.z_far,
        )
        .to_homogeneous();

        // Flip Y to account for the viewport flip.
        self.project[(1, 1)] *= -1.0;
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.parameters.aspect_ratio = aspect_ratio;
        self.update_matrices();
    }

    /// The camera data in a shader-ready layout.
    pub fn shader_data(&self) -> CameraShaderData {
        CameraShaderData {
            position: self.position.coords,
            _padding: 0.0,
            view: self.view,
            project: self.project,
            view_inverse: self.view.try_inverse().unwrap_or_else(Matrix4::identity),
            project_inverse: self.project.try_inverse().unwrap_or_else(Matrix4::identity),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(
            CameraParameters::default(),
            Point3::origin(),
            Point3::from(world_forward()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_matrices_are_invertible() {
        let camera = Camera::new(
            CameraParameters::default(),
            Point3::new(0.0, 1.0, -5.0),
            Point3::origin(),
        );
        let data = camera.shader_data();

        let view_roundtrip = data.view * data.view_inverse;
        let project_roundtrip = data.project * data.project_inverse;
        assert!((view_roundtrip - Matrix4::identity()).abs().max() < 1e-4);
        assert!((project_roundtrip - Matrix4::identity()).abs().max() < 1e-4);
    }

    #[test]
    fn test_camera_motion_changes_equality() {
        let still = Camera::default();
        let mut moved = still.clone();
        assert_eq!(still, moved);

        moved.position = Point3::new(0.0, 0.0, -1.0);
        moved.update_matrices();
        assert_ne!(still, moved);
    }

    #[test]
    fn test_projection_flips_y() {
        let camera = Camera::default();
        let data = camera.shader_data();

        let unflipped = Perspective3::new(
            camera.parameters.aspect_ratio,
            camera.parameters.fov_y_degrees.to_radians(),
            camera.parameters.z_near,
            camera.parameters.z_far,
        )
        .to_homogeneous()[(1, 1)];
        assert_eq!(data.project[(1, 1)], -unflipped);
    }
}
