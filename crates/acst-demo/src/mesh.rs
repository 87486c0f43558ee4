//! Procedural sample geometry and its upload into shared buffers.

use acst::{
    headless::{HeadlessBuffer, HeadlessDevice},
    BlasGeometryDesc, Buffer as _, BufferAddresses, Device as _, GeometryLayout, GeometrySource,
    MeshSource, Transform3x4,
};
use miette::{Context, IntoDiagnostic};

/// Indexed triangle list.
#[derive(Clone, Debug)]
pub struct Triangles {
    pub positions: Vec<na::Point3<f32>>,
    pub indices: Vec<u32>,
}

impl Triangles {
    pub fn triangle() -> Self {
        Triangles {
            positions: vec![
                na::Point3::new(-1.0, -1.0, 0.0),
                na::Point3::new(1.0, -1.0, 0.0),
                na::Point3::new(0.0, 1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
        }
    }

    pub fn quad(size: f32) -> Self {
        let h = size * 0.5;
        Triangles {
            positions: vec![
                na::Point3::new(-h, 0.0, -h),
                na::Point3::new(h, 0.0, -h),
                na::Point3::new(h, 0.0, h),
                na::Point3::new(-h, 0.0, h),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        let positions = (0..8)
            .map(|i| {
                na::Point3::new(
                    if i & 1 == 0 { -h } else { h },
                    if i & 2 == 0 { -h } else { h },
                    if i & 4 == 0 { -h } else { h },
                )
            })
            .collect();

        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ];

        Triangles { positions, indices }
    }

    /// Flat grid of `n` by `n` quads.
    pub fn grid(n: u32, size: f32) -> Self {
        let step = size / n as f32;
        let origin = -size * 0.5;
        let mut positions = Vec::with_capacity(((n + 1) * (n + 1)) as usize);
        for z in 0..=n {
            for x in 0..=n {
                positions.push(na::Point3::new(
                    origin + x as f32 * step,
                    0.0,
                    origin + z as f32 * step,
                ));
            }
        }

        let mut indices = Vec::with_capacity((n * n * 6) as usize);
        for z in 0..n {
            for x in 0..n {
                let a = z * (n + 1) + x;
                let b = a + n + 1;
                indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }

        Triangles { positions, indices }
    }

    fn vertex_bytes(&self) -> Vec<u8> {
        let flat: Vec<[f32; 3]> = self.positions.iter().map(|p| [p.x, p.y, p.z]).collect();
        bytemuck::cast_slice(&flat).to_vec()
    }
}

/// Axis-aligned box stored as `min` then `max` corner.
#[derive(Clone, Copy, Debug)]
pub struct Aabb {
    pub min: na::Point3<f32>,
    pub max: na::Point3<f32>,
}

impl Aabb {
    pub fn around(center: na::Point3<f32>, half: f32) -> Self {
        let extent = na::Vector3::repeat(half);
        Aabb {
            min: center - extent,
            max: center + extent,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Shape {
    Triangles(Triangles),
    Boxes(Vec<Aabb>),
}

impl Shape {
    fn source(&self) -> GeometrySource {
        match self {
            Shape::Triangles(triangles) => GeometrySource::indexed_triangles(
                triangles.positions.len() as u32,
                triangles.indices.len() as u32,
            ),
            Shape::Boxes(boxes) => GeometrySource::boxes(boxes.len() as u32),
        }
    }

    fn vertex_bytes(&self) -> Vec<u8> {
        match self {
            Shape::Triangles(triangles) => triangles.vertex_bytes(),
            Shape::Boxes(boxes) => {
                let flat: Vec<[f32; 6]> = boxes
                    .iter()
                    .map(|b| [b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z])
                    .collect();
                bytemuck::cast_slice(&flat).to_vec()
            }
        }
    }

    fn index_bytes(&self) -> &[u8] {
        match self {
            Shape::Triangles(triangles) => bytemuck::cast_slice(&triangles.indices),
            Shape::Boxes(_) => &[],
        }
    }
}

/// Geometries of one bottom-level structure.
#[derive(Clone, Debug)]
pub struct MeshData {
    pub shapes: Vec<Shape>,

    /// Placement applied to every geometry of the mesh during the build.
    pub transform: Option<na::Isometry3<f32>>,
}

impl MeshData {
    pub fn single(shape: Shape) -> Self {
        MeshData {
            shapes: vec![shape],
            transform: None,
        }
    }
}

/// Converts affine transform into the row-major layout builds consume.
pub fn transform(matrix: &na::Matrix4<f32>) -> Transform3x4 {
    let mut rows = [[0.0; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = matrix[(r, c)];
        }
    }
    Transform3x4::from_rows(rows)
}

/// Scene geometry packed into shared buffers.
///
/// Vertex data is replicated `copies` times so that it can be rewritten
/// while previous frames still read older copies.
pub struct SceneGeometry {
    layout: GeometryLayout,
    vertices: Vec<HeadlessBuffer>,
    indices: HeadlessBuffer,
    transforms: HeadlessBuffer,
}

impl SceneGeometry {
    pub fn upload(
        device: &HeadlessDevice,
        meshes: &[MeshData],
        copies: usize,
    ) -> miette::Result<Self> {
        let sources: Vec<Vec<GeometrySource>> = meshes
            .iter()
            .map(|mesh| mesh.shapes.iter().map(Shape::source).collect())
            .collect();
        let mesh_sources: Vec<MeshSource<'_>> = meshes
            .iter()
            .zip(&sources)
            .map(|(mesh, geometries)| MeshSource {
                geometries,
                transformed: mesh.transform.is_some(),
            })
            .collect();

        let layout = GeometryLayout::plan(&mesh_sources);

        let new_buffer = |size: usize| {
            device
                .new_geometry_buffer(size.max(16))
                .into_diagnostic()
                .context("Failed to allocate geometry buffer")
        };

        let mut geometry = SceneGeometry {
            vertices: (0..copies.max(1))
                .map(|_| new_buffer(layout.vertex_size()))
                .collect::<miette::Result<_>>()?,
            indices: new_buffer(layout.index_size())?,
            transforms: new_buffer(layout.transform_size())?,
            layout,
        };

        let shapes = meshes.iter().flat_map(|mesh| &mesh.shapes);
        for (index, shape) in shapes.enumerate() {
            let placement = geometry.layout.geometries()[index];
            let bytes = shape.vertex_bytes();
            for copy in &mut geometry.vertices {
                device
                    .write_buffer(copy, placement.vertex_offset, &bytes)
                    .into_diagnostic()?;
            }
            device
                .write_buffer(&mut geometry.indices, placement.index_offset, shape.index_bytes())
                .into_diagnostic()?;
        }

        for (mesh, placement) in meshes.iter().zip(geometry.layout.meshes()) {
            if let (Some(isometry), Some(offset)) = (&mesh.transform, placement.transform_offset) {
                let transform = transform(&isometry.to_homogeneous());
                device
                    .write_buffer(&mut geometry.transforms, offset, bytemuck::bytes_of(&transform))
                    .into_diagnostic()?;
            }
        }

        tracing::debug!(
            "Uploaded {} geometries of {} meshes in {} vertex copies",
            geometry.layout.geometries().len(),
            meshes.len(),
            geometry.vertices.len()
        );

        Ok(geometry)
    }

    pub fn layout(&self) -> &GeometryLayout {
        &self.layout
    }

    pub fn copies(&self) -> usize {
        self.vertices.len()
    }

    fn addresses(&self, copy: usize) -> BufferAddresses {
        BufferAddresses {
            vertices: self.vertices[copy].address(),
            indices: self.indices.address(),
            transforms: self.transforms.address(),
        }
    }

    /// Descriptors of mesh geometries reading vertex copy `copy`.
    pub fn descriptors(&self, mesh: usize, copy: usize) -> Vec<BlasGeometryDesc> {
        self.layout.mesh_descriptors(mesh, &self.addresses(copy))
    }

    /// Overwrites vertex positions of one geometry in vertex copy `copy`.
    pub fn write_vertices(
        &mut self,
        device: &HeadlessDevice,
        geometry: usize,
        copy: usize,
        triangles: &Triangles,
    ) -> miette::Result<()> {
        let placement = self.layout.geometries()[geometry];
        let bytes = triangles.vertex_bytes();
        if bytes.len() != placement.vertex_size {
            miette::bail!(
                "Geometry {geometry} holds {} vertex bytes, got {}",
                placement.vertex_size,
                bytes.len()
            );
        }

        device
            .write_buffer(&mut self.vertices[copy], placement.vertex_offset, &bytes)
            .into_diagnostic()
    }

    /// Frees the buffers. Builds reading them must have completed.
    pub fn destroy(self, device: &HeadlessDevice) {
        for buffer in self.vertices {
            device.destroy_buffer(buffer);
        }
        device.destroy_buffer(self.indices);
        device.destroy_buffer(self.transforms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_has_two_triangles_per_cell() {
        let grid = Triangles::grid(4, 2.0);
        assert_eq!(grid.positions.len(), 25);
        assert_eq!(grid.indices.len(), 4 * 4 * 6);
        assert!(grid.indices.iter().all(|&i| (i as usize) < grid.positions.len()));
    }

    #[test]
    fn transform_keeps_translation() {
        let isometry = na::Isometry3::translation(1.0, 2.0, 3.0);
        let transform = transform(&isometry.to_homogeneous());
        assert_eq!(transform.translation(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn upload_writes_every_copy() {
        let device = HeadlessDevice::default();
        let meshes = [
            MeshData::single(Shape::Triangles(Triangles::cube(1.0))),
            MeshData {
                shapes: vec![Shape::Boxes(vec![Aabb::around(na::Point3::origin(), 0.5)])],
                transform: Some(na::Isometry3::translation(0.0, 1.0, 0.0)),
            },
        ];

        let geometry = SceneGeometry::upload(&device, &meshes, 2).unwrap();
        assert_eq!(geometry.copies(), 2);
        assert_eq!(geometry.layout().vertex_size(), 8 * 12 + 24);

        let first = geometry.descriptors(1, 0);
        let second = geometry.descriptors(1, 1);
        assert_ne!(first[0].addresses().data, second[0].addresses().data);
        assert!(device.take_validation_errors().is_empty());

        geometry.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
    }
}
