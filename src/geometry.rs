// Geometry - the textured cube, its instances, and the camera
//
// Vertex layout (binding 0, per vertex):
//   location 0: position vec4
//   location 1: uv       vec2
// Instance layout (binding 1, per instance):
//   locations 2-5: model matrix columns
//   location 6:    rotation angles (radians, xyz)

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

pub const VERTEX_BINDING: u32 = 0;
pub const INSTANCE_BINDING: u32 = 1;

/// Six faces, two triangles each
pub const CUBE_VERTEX_COUNT: u32 = 36;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
    pub rotation: [f32; 3],
}

/// Unit cube (half extent 1) with counter-clockwise outward faces
pub fn textured_cube() -> Vec<Vertex> {
    // (normal, u axis, v axis) with u x v == normal
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];

    let mut vertices = Vec::with_capacity(CUBE_VERTEX_COUNT as usize);
    for (n, u, v) in faces {
        let corners = [
            (n - u - v, [0.0, 1.0]),
            (n + u - v, [1.0, 1.0]),
            (n + u + v, [1.0, 0.0]),
            (n - u + v, [0.0, 0.0]),
        ];
        for i in [0, 1, 2, 0, 2, 3] {
            let (p, uv) = corners[i];
            vertices.push(Vertex {
                position: [p.x, p.y, p.z, 1.0],
                uv,
            });
        }
    }
    vertices
}

pub fn vertex_bindings() -> [vk::VertexInputBindingDescription; 2] {
    [
        vk::VertexInputBindingDescription {
            binding: VERTEX_BINDING,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        },
        vk::VertexInputBindingDescription {
            binding: INSTANCE_BINDING,
            stride: std::mem::size_of::<InstanceData>() as u32,
            input_rate: vk::VertexInputRate::INSTANCE,
        },
    ]
}

pub fn vertex_attributes() -> Vec<vk::VertexInputAttributeDescription> {
    let attribute = |binding, location, format, offset| vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset,
    };

    let mut attributes = vec![
        attribute(VERTEX_BINDING, 0, vk::Format::R32G32B32A32_SFLOAT, 0),
        attribute(VERTEX_BINDING, 1, vk::Format::R32G32_SFLOAT, 16),
    ];
    for column in 0..4 {
        attributes.push(attribute(
            INSTANCE_BINDING,
            2 + column,
            vk::Format::R32G32B32A32_SFLOAT,
            16 * column,
        ));
    }
    attributes.push(attribute(INSTANCE_BINDING, 6, vk::Format::R32G32B32_SFLOAT, 64));
    attributes
}

/// Distance of every instance from the origin
pub const INSTANCE_RADIUS: f32 = 6.0;
const INSTANCE_SCALE: f32 = 0.5;

/// `count` cubes spread evenly over a sphere (Fibonacci lattice)
pub fn instance_layout(count: u32) -> Vec<InstanceData> {
    let golden_angle = std::f32::consts::PI * (3.0 - 5f32.sqrt());

    (0..count)
        .map(|i| {
            let i = i as f32;
            let y = 1.0 - 2.0 * (i + 0.5) / count as f32;
            let ring = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden_angle * i;
            let position = Vec3::new(theta.cos() * ring, y, theta.sin() * ring) * INSTANCE_RADIUS;

            let model = Mat4::from_translation(position) * Mat4::from_scale(Vec3::splat(INSTANCE_SCALE));
            InstanceData {
                model: model.to_cols_array_2d(),
                rotation: [theta, theta * 0.5, i * 0.25],
            }
        })
        .collect()
}

/// Radians per second a drawable spins
pub const SPIN_SPEED: f32 = 0.6;

/// Camera and per-drawable spin
#[derive(Debug, Clone, Copy)]
pub struct Spin {
    pub angle: f32,
    /// +1.0 or -1.0
    pub direction: f32,
}

impl Spin {
    pub fn new(reverse: bool) -> Self {
        Self {
            angle: 0.0,
            direction: if reverse { -1.0 } else { 1.0 },
        }
    }

    pub fn advance(&mut self, dt: f32) {
        self.angle = (self.angle + self.direction * SPIN_SPEED * dt) % std::f32::consts::TAU;
    }

    pub fn model(&self) -> Mat4 {
        Mat4::from_axis_angle(Vec3::Y, self.angle)
            * Mat4::from_axis_angle(Vec3::ONE.normalize(), self.angle)
    }
}

/// Perspective (45 degrees, 0..1 depth, y down) times a look-at from the diagonal
pub fn view_projection(extent: vk::Extent2D) -> Mat4 {
    let aspect = if extent.height == 0 {
        1.0
    } else {
        extent.width as f32 / extent.height as f32
    };

    let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
    // Vulkan clip space has y pointing down
    projection.y_axis.y *= -1.0;

    let view = Mat4::look_at_rh(Vec3::splat(12.0), Vec3::ZERO, Vec3::Y);
    projection * view
}

pub fn model_view_projection(extent: vk::Extent2D, spin: &Spin) -> Mat4 {
    view_projection(extent) * spin.model()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn cube_faces_wind_outward() {
        let vertices = textured_cube();
        assert_eq!(vertices.len(), CUBE_VERTEX_COUNT as usize);

        for triangle in vertices.chunks_exact(3) {
            let p: Vec<Vec3> = triangle
                .iter()
                .map(|v| Vec3::new(v.position[0], v.position[1], v.position[2]))
                .collect();
            let normal = (p[1] - p[0]).cross(p[2] - p[0]);
            let centroid = (p[0] + p[1] + p[2]) / 3.0;
            assert!(normal.dot(centroid) > 0.0, "inward triangle {:?}", p);
        }

        assert!(vertices
            .iter()
            .all(|v| v.position.iter().take(3).all(|c| c.abs() == 1.0)));
    }

    #[test]
    fn layouts_match_struct_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(std::mem::size_of::<InstanceData>(), 76);

        let attributes = vertex_attributes();
        assert_eq!(attributes.len(), 7);
        let rotation = attributes.last().unwrap();
        assert_eq!(rotation.location, 6);
        assert_eq!(rotation.offset, 64);

        let bindings = vertex_bindings();
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
    }

    #[test]
    fn instances_sit_on_the_sphere() {
        let instances = instance_layout(100);
        assert_eq!(instances.len(), 100);

        for instance in &instances {
            let model = Mat4::from_cols_array_2d(&instance.model);
            let position = model.w_axis.truncate();
            assert!((position.length() - INSTANCE_RADIUS).abs() < 1e-3);
        }

        // Deterministic
        assert_eq!(instances, instance_layout(100));
        assert!(instance_layout(0).is_empty());
    }

    #[test]
    fn origin_lands_inside_clip_volume() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let clip = model_view_projection(extent, &Spin::new(false)) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);

        // Zero height must not produce NaNs
        let flat = view_projection(vk::Extent2D {
            width: 10,
            height: 0,
        });
        assert!(flat.is_finite());
    }

    #[test]
    fn spins_run_in_opposite_directions() {
        let mut forward = Spin::new(false);
        let mut reverse = Spin::new(true);
        forward.advance(0.5);
        reverse.advance(0.5);
        assert!(forward.angle > 0.0);
        assert!((forward.angle + reverse.angle).abs() < 1e-6);
    }
}
