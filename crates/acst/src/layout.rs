//! Packing of scene geometry into shared vertex, index and transform buffers.

use std::ops::Range;

use crate::generic::{
    BlasAabbs, BlasGeometryDesc, BlasIndices, BlasTriangles, DeviceAddress, IndexFormat,
    Transform3x4, VertexFormat,
};

/// Geometry as produced by the import pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometrySource {
    Triangles {
        vertex_format: VertexFormat,
        vertex_stride: usize,
        vertex_count: u32,

        /// Index format and count. `None` for non-indexed triangle lists.
        indices: Option<(IndexFormat, u32)>,
        opaque: bool,
    },
    Aabbs {
        box_stride: usize,
        box_count: u32,
        opaque: bool,
    },
}

impl GeometrySource {
    /// Triangle list with 32-bit indices and tightly packed `f32` positions.
    pub fn indexed_triangles(vertex_count: u32, index_count: u32) -> Self {
        GeometrySource::Triangles {
            vertex_format: VertexFormat::Float32x3,
            vertex_stride: VertexFormat::Float32x3.size(),
            vertex_count,
            indices: Some((IndexFormat::Uint32, index_count)),
            opaque: true,
        }
    }

    /// Axis-aligned boxes stored as six `f32` each.
    pub fn boxes(box_count: u32) -> Self {
        GeometrySource::Aabbs {
            box_stride: 24,
            box_count,
            opaque: false,
        }
    }
}

/// Mesh owning one or more geometries.
#[derive(Clone, Copy, Debug)]
pub struct MeshSource<'a> {
    pub geometries: &'a [GeometrySource],

    /// Whether geometries of this mesh are placed with a transform.
    /// One transform is shared by all of them.
    pub transformed: bool,
}

/// Where one geometry lands in the shared buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryPlacement {
    pub mesh: usize,
    pub vertex_offset: usize,
    pub vertex_size: usize,
    pub index_offset: usize,
    pub index_size: usize,
    pub transform_offset: Option<usize>,
    pub material_index: u32,
    pub primitive_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshPlacement {
    /// Indices into [`GeometryLayout::geometries`].
    pub geometries: Range<usize>,
    pub transform_offset: Option<usize>,

    /// Material index of the first geometry.
    /// Used as the instance custom index so that shaders find
    /// per-geometry material at `custom_index + geometry_index`.
    pub first_material: u32,
}

/// Base addresses of the three shared buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferAddresses {
    pub vertices: DeviceAddress,
    pub indices: DeviceAddress,
    pub transforms: DeviceAddress,
}

/// Result of packing meshes into shared buffers.
///
/// Regions are laid out back to back in input order, without padding.
#[derive(Clone, Debug, Default)]
pub struct GeometryLayout {
    sources: Vec<GeometrySource>,
    geometries: Vec<GeometryPlacement>,
    meshes: Vec<MeshPlacement>,
    vertex_size: usize,
    index_size: usize,
    transform_size: usize,
}

impl GeometryLayout {
    pub fn plan(meshes: &[MeshSource<'_>]) -> Self {
        let mut layout = GeometryLayout::default();
        let mut material = 0u32;

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            let transform_offset = if mesh.transformed {
                let offset = layout.transform_size;
                layout.transform_size += Transform3x4::SIZE;
                Some(offset)
            } else {
                None
            };

            let first = layout.geometries.len();
            let first_material = material;

            for source in mesh.geometries {
                let (vertex_size, index_size, primitive_count) = measure(source);

                layout.geometries.push(GeometryPlacement {
                    mesh: mesh_index,
                    vertex_offset: layout.vertex_size,
                    vertex_size,
                    index_offset: layout.index_size,
                    index_size,
                    transform_offset,
                    material_index: material,
                    primitive_count,
                });
                layout.sources.push(*source);

                layout.vertex_size += vertex_size;
                layout.index_size += index_size;
                material += 1;
            }

            layout.meshes.push(MeshPlacement {
                geometries: first..layout.geometries.len(),
                transform_offset,
                first_material,
            });
        }

        tracing::trace!(
            "Planned {} geometries: {} vertex bytes, {} index bytes, {} transform bytes",
            layout.geometries.len(),
            layout.vertex_size,
            layout.index_size,
            layout.transform_size
        );

        layout
    }

    pub fn geometries(&self) -> &[GeometryPlacement] {
        &self.geometries
    }

    pub fn meshes(&self) -> &[MeshPlacement] {
        &self.meshes
    }

    /// Total size of the shared vertex buffer. Boxes are packed there too.
    pub fn vertex_size(&self) -> usize {
        self.vertex_size
    }

    pub fn index_size(&self) -> usize {
        self.index_size
    }

    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    /// Number of per-geometry material records.
    pub fn material_count(&self) -> usize {
        self.geometries.len()
    }

    /// Emits descriptor of one geometry reading from buffers at `addresses`.
    pub fn descriptor(&self, geometry: usize, addresses: &BufferAddresses) -> BlasGeometryDesc {
        let placement = &self.geometries[geometry];
        let transform = placement
            .transform_offset
            .map(|offset| addresses.transforms + offset as u64);

        match self.sources[geometry] {
            GeometrySource::Triangles {
                vertex_format,
                vertex_stride,
                vertex_count,
                indices,
                opaque,
            } => BlasGeometryDesc::Triangles(BlasTriangles {
                opaque,
                vertex_format,
                vertex_stride,
                max_vertex: vertex_count.saturating_sub(1),
                vertices: addresses.vertices + placement.vertex_offset as u64,
                indices: indices.map(|(format, _)| BlasIndices {
                    format,
                    address: addresses.indices + placement.index_offset as u64,
                }),
                transform,
                primitive_count: placement.primitive_count,
            }),
            GeometrySource::Aabbs {
                box_stride, opaque, ..
            } => BlasGeometryDesc::Aabbs(BlasAabbs {
                opaque,
                boxes: addresses.vertices + placement.vertex_offset as u64,
                box_stride,
                primitive_count: placement.primitive_count,
            }),
        }
    }

    /// Emits descriptors of all geometries of one mesh.
    pub fn mesh_descriptors(&self, mesh: usize, addresses: &BufferAddresses) -> Vec<BlasGeometryDesc> {
        self.meshes[mesh]
            .geometries
            .clone()
            .map(|geometry| self.descriptor(geometry, addresses))
            .collect()
    }
}

/// Returns vertex bytes, index bytes and primitive count.
/// Geometry without vertices occupies nothing.
fn measure(source: &GeometrySource) -> (usize, usize, u32) {
    match *source {
        GeometrySource::Triangles { vertex_count: 0, .. } => (0, 0, 0),
        GeometrySource::Triangles {
            vertex_stride,
            vertex_count,
            indices: Some((format, index_count)),
            ..
        } => (
            vertex_count as usize * vertex_stride,
            index_count as usize * format.size(),
            index_count / 3,
        ),
        GeometrySource::Triangles {
            vertex_stride,
            vertex_count,
            indices: None,
            ..
        } => (vertex_count as usize * vertex_stride, 0, vertex_count / 3),
        GeometrySource::Aabbs {
            box_stride,
            box_count,
            ..
        } => (box_count as usize * box_stride, 0, box_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> Vec<Vec<GeometrySource>> {
        vec![
            vec![
                GeometrySource::indexed_triangles(3, 3),
                GeometrySource::indexed_triangles(24, 36),
            ],
            vec![GeometrySource::Triangles {
                vertex_format: VertexFormat::Float32x3,
                vertex_stride: 16,
                vertex_count: 6,
                indices: None,
                opaque: false,
            }],
            vec![GeometrySource::boxes(4), GeometrySource::indexed_triangles(0, 9)],
            vec![GeometrySource::Triangles {
                vertex_format: VertexFormat::Float16x4,
                vertex_stride: 8,
                vertex_count: 100,
                indices: Some((IndexFormat::Uint16, 297)),
                opaque: true,
            }],
        ]
    }

    fn plan(geometries: &[Vec<GeometrySource>]) -> GeometryLayout {
        let meshes: Vec<_> = geometries
            .iter()
            .enumerate()
            .map(|(index, geometries)| MeshSource {
                geometries,
                transformed: index % 2 == 0,
            })
            .collect();
        GeometryLayout::plan(&meshes)
    }

    #[test]
    fn offsets_increase_without_overlap() {
        let layout = plan(&scene());

        let mut vertex_end = 0;
        let mut index_end = 0;
        for placement in layout.geometries() {
            assert!(placement.vertex_offset >= vertex_end);
            assert!(placement.index_offset >= index_end);
            vertex_end = placement.vertex_offset + placement.vertex_size;
            index_end = placement.index_offset + placement.index_size;
        }

        let mut transform_end = 0;
        for mesh in layout.meshes() {
            if let Some(offset) = mesh.transform_offset {
                assert!(offset >= transform_end);
                transform_end = offset + Transform3x4::SIZE;
            }
        }

        assert_eq!(vertex_end, layout.vertex_size());
        assert_eq!(index_end, layout.index_size());
        assert_eq!(transform_end, layout.transform_size());
    }

    /// Deterministic pseudo-random scenes of varying shape.
    fn generated_scenes() -> Vec<Vec<Vec<GeometrySource>>> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move |bound: u64| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state % bound
        };

        (0..32)
            .map(|_| {
                (0..next(6))
                    .map(|_| {
                        (0..1 + next(4))
                            .map(|_| match next(4) {
                                0 => GeometrySource::boxes(next(20) as u32),
                                1 => GeometrySource::Triangles {
                                    vertex_format: VertexFormat::Float32x3,
                                    vertex_stride: 12 + 4 * next(3) as usize,
                                    vertex_count: 3 * next(10) as u32,
                                    indices: None,
                                    opaque: next(2) == 0,
                                },
                                2 => GeometrySource::Triangles {
                                    vertex_format: VertexFormat::Float16x4,
                                    vertex_stride: 8,
                                    vertex_count: next(50) as u32,
                                    indices: Some((IndexFormat::Uint16, 3 * next(40) as u32)),
                                    opaque: true,
                                },
                                _ => GeometrySource::indexed_triangles(
                                    next(30) as u32,
                                    3 * next(30) as u32,
                                ),
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn generated_layouts_are_packed() {
        for scene in generated_scenes() {
            let layout = plan(&scene);
            let sources: Vec<GeometrySource> = scene.iter().flatten().copied().collect();
            assert_eq!(layout.geometries().len(), sources.len());

            let mut vertex_end = 0;
            let mut index_end = 0;
            for (index, (placement, source)) in layout.geometries().iter().zip(&sources).enumerate() {
                assert_eq!(placement.vertex_offset, vertex_end);
                assert_eq!(placement.index_offset, index_end);
                assert_eq!(placement.material_index, index as u32);

                let (vertex_size, index_size) = match *source {
                    GeometrySource::Triangles { vertex_count: 0, .. } => (0, 0),
                    GeometrySource::Triangles {
                        vertex_stride,
                        vertex_count,
                        indices,
                        ..
                    } => (
                        vertex_count as usize * vertex_stride,
                        indices.map_or(0, |(format, count)| count as usize * format.size()),
                    ),
                    GeometrySource::Aabbs {
                        box_stride,
                        box_count,
                        ..
                    } => (box_count as usize * box_stride, 0),
                };
                assert_eq!(placement.vertex_size, vertex_size);
                assert_eq!(placement.index_size, index_size);

                vertex_end += vertex_size;
                index_end += index_size;
            }
            assert_eq!(layout.vertex_size(), vertex_end);
            assert_eq!(layout.index_size(), index_end);

            let transformed = (0..scene.len()).filter(|index| index % 2 == 0).count();
            assert_eq!(layout.transform_size(), transformed * Transform3x4::SIZE);
            assert_eq!(layout.meshes().len(), scene.len());
            assert_eq!(layout.material_count(), sources.len());
        }
    }

    #[test]
    fn totals_are_sums_of_geometry_sizes() {
        let layout = plan(&scene());

        let vertices: usize = layout.geometries().iter().map(|g| g.vertex_size).sum();
        let indices: usize = layout.geometries().iter().map(|g| g.index_size).sum();
        assert_eq!(layout.vertex_size(), vertices);
        assert_eq!(layout.index_size(), indices);
        assert_eq!(layout.vertex_size(), 36 + 288 + 96 + 96 + 800);
        assert_eq!(layout.index_size(), 12 + 144 + 594);

        // Transforms for the first and third meshes only.
        assert_eq!(layout.transform_size(), 2 * Transform3x4::SIZE);
    }

    #[test]
    fn mesh_shares_transform_and_assigns_materials() {
        let layout = plan(&scene());

        let first = &layout.meshes()[0];
        let [a, b] = [&layout.geometries()[0], &layout.geometries()[1]];
        assert_eq!(a.transform_offset, first.transform_offset);
        assert_eq!(b.transform_offset, first.transform_offset);

        let materials: Vec<_> = layout.meshes().iter().map(|m| m.first_material).collect();
        assert_eq!(materials, [0, 2, 3, 5]);
        assert_eq!(layout.material_count(), 6);
    }

    #[test]
    fn zero_vertices_yield_zero_size_descriptor() {
        let layout = plan(&scene());
        let empty = &layout.geometries()[4];
        assert_eq!(empty.vertex_size, 0);
        assert_eq!(empty.index_size, 0);
        assert_eq!(empty.primitive_count, 0);

        let addresses = BufferAddresses {
            vertices: 0x1_0000,
            indices: 0x2_0000,
            transforms: 0x3_0000,
        };
        assert_eq!(layout.descriptor(4, &addresses).primitive_count(), 0);
    }

    #[test]
    fn descriptors_point_into_shared_buffers() {
        let layout = plan(&scene());
        let addresses = BufferAddresses {
            vertices: 0x1_0000,
            indices: 0x2_0000,
            transforms: 0x3_0000,
        };

        let descriptors = layout.mesh_descriptors(0, &addresses);
        assert_eq!(descriptors.len(), 2);
        match descriptors[1] {
            BlasGeometryDesc::Triangles(triangles) => {
                assert_eq!(triangles.vertices, 0x1_0000 + 36);
                assert_eq!(triangles.indices.map(|i| i.address), Some(0x2_0000 + 12));
                assert_eq!(triangles.transform, Some(0x3_0000));
                assert_eq!(triangles.primitive_count, 12);
                assert_eq!(triangles.max_vertex, 23);
            }
            BlasGeometryDesc::Aabbs(_) => panic!("expected triangles"),
        }

        match layout.descriptor(3, &addresses) {
            BlasGeometryDesc::Aabbs(aabbs) => {
                assert_eq!(aabbs.boxes, 0x1_0000 + 36 + 288 + 96);
                assert_eq!(aabbs.primitive_count, 4);
            }
            BlasGeometryDesc::Triangles(_) => panic!("expected boxes"),
        }

        // Second mesh has no transform.
        match layout.descriptor(2, &addresses) {
            BlasGeometryDesc::Triangles(triangles) => {
                assert_eq!(triangles.transform, None);
                assert_eq!(triangles.primitive_count, 2);
            }
            BlasGeometryDesc::Aabbs(_) => panic!("expected triangles"),
        }
    }
}
