/// Format of vertex positions consumed by a triangle geometry build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float16x2,
    Float16x4,
    Float32x2,
    Float32x3,
    Snorm16x2,
    Snorm16x4,
}

impl VertexFormat {
    /// Size of one vertex position in bytes.
    pub const fn size(&self) -> usize {
        match self {
            VertexFormat::Float16x2 => 4,
            VertexFormat::Float16x4 => 8,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Snorm16x2 => 4,
            VertexFormat::Snorm16x4 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn size(&self) -> usize {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}
