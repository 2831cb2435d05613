// Mesh data and its lazily uploaded GPU buffers.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferId, BufferUploader};

/// Interleaved vertex: position then color
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const POSITION_OFFSET: u32 = 0;
    pub const COLOR_OFFSET: u32 = 12;

    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }
}

/// Index element type; fixes the index width for a mesh type
pub trait MeshIndex: Pod {
    const INDEX_TYPE: vk::IndexType;
}

impl MeshIndex for u16 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;
}

impl MeshIndex for u32 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
}

/// Buffer ids of an uploaded mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertex: BufferId,
    pub index: BufferId,
}

/// Whether a mesh has been uploaded yet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MeshGpuState {
    #[default]
    NotUploaded,
    Uploaded(MeshBuffers),
}

pub struct Mesh<I: MeshIndex = u32> {
    vertices: Vec<Vertex>,
    indices: Vec<I>,
    gpu: MeshGpuState,
}

impl<I: MeshIndex> Mesh<I> {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<I>) -> Self {
        Self {
            vertices,
            indices,
            gpu: MeshGpuState::NotUploaded,
        }
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[I] {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn gpu_state(&self) -> MeshGpuState {
        self.gpu
    }

    /// Nothing to draw (and nothing that could be uploaded)
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Return the mesh's buffers, uploading vertices and indices the first
    /// time. Later calls never touch `uploader`.
    pub fn upload_or_get(&mut self, uploader: &mut impl BufferUploader) -> Result<MeshBuffers> {
        if let MeshGpuState::Uploaded(buffers) = self.gpu {
            return Ok(buffers);
        }

        let vertex = uploader.upload(
            bytemuck::cast_slice(&self.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index = uploader.upload(
            bytemuck::cast_slice(&self.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let buffers = MeshBuffers { vertex, index };
        self.gpu = MeshGpuState::Uploaded(buffers);
        Ok(buffers)
    }
}

/// Unit cube centred on the origin, one color per face
pub fn cube() -> Mesh<u16> {
    const FACES: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
        // normal, u axis, v axis, color
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.9, 0.3, 0.3]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.3]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.3, 0.3, 0.9]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.9, 0.9, 0.3]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.3, 0.9, 0.9]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.9, 0.3, 0.9]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (n, u, v, color) in FACES {
        let base = vertices.len() as u16;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = [
                0.5 * (n[0] + su * u[0] + sv * v[0]),
                0.5 * (n[1] + su * u[1] + sv * v[1]),
                0.5 * (n[2] + su * u[2] + sv * v[2]),
            ];
            vertices.push(Vertex::new(position, color));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    Mesh::new(vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;

    /// Counts uploads and remembers what it was given
    #[derive(Default)]
    struct CountingUploader {
        calls: Vec<(usize, vk::BufferUsageFlags)>,
    }

    impl BufferUploader for CountingUploader {
        fn upload(&mut self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<BufferId> {
            self.calls.push((data.len(), usage));
            Ok(BufferId(self.calls.len() as u64 - 1))
        }
    }

    struct FailingUploader;

    impl BufferUploader for FailingUploader {
        fn upload(&mut self, _data: &[u8], _usage: vk::BufferUsageFlags) -> Result<BufferId> {
            Err(GpuError::NoMatchingMemoryType {
                type_bits: 0,
                flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            }
            .into())
        }
    }

    fn triangle() -> Mesh<u32> {
        Mesh::new(
            vec![
                Vertex::new([0.0, -0.5, 0.0], [1.0, 0.0, 0.0]),
                Vertex::new([0.5, 0.5, 0.0], [0.0, 1.0, 0.0]),
                Vertex::new([-0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(
            std::mem::offset_of!(Vertex, color) as u32,
            Vertex::COLOR_OFFSET
        );
    }

    #[test]
    fn drawing_twice_uploads_once() {
        let mut mesh = triangle();
        let mut uploader = CountingUploader::default();

        let first = mesh.upload_or_get(&mut uploader).unwrap();
        let second = mesh.upload_or_get(&mut uploader).unwrap();

        assert_eq!(first, second);
        // One call for vertices, one for indices, none on the second draw
        assert_eq!(uploader.calls.len(), 2);
        assert_eq!(mesh.gpu_state(), MeshGpuState::Uploaded(first));
    }

    #[test]
    fn uploads_use_vertex_then_index_usage() {
        let mut mesh = triangle();
        let mut uploader = CountingUploader::default();
        let buffers = mesh.upload_or_get(&mut uploader).unwrap();

        assert_eq!(
            uploader.calls,
            vec![
                (3 * 24, vk::BufferUsageFlags::VERTEX_BUFFER),
                (3 * 4, vk::BufferUsageFlags::INDEX_BUFFER),
            ]
        );
        assert_eq!(buffers.vertex, BufferId(0));
        assert_eq!(buffers.index, BufferId(1));
    }

    #[test]
    fn failed_upload_leaves_mesh_not_uploaded() {
        let mut mesh = triangle();
        assert!(mesh.upload_or_get(&mut FailingUploader).is_err());
        assert_eq!(mesh.gpu_state(), MeshGpuState::NotUploaded);

        let mut uploader = CountingUploader::default();
        mesh.upload_or_get(&mut uploader).unwrap();
        assert_eq!(uploader.calls.len(), 2);
    }

    #[test]
    fn index_width_follows_type() {
        assert_eq!(<u16 as MeshIndex>::INDEX_TYPE, vk::IndexType::UINT16);
        assert_eq!(<u32 as MeshIndex>::INDEX_TYPE, vk::IndexType::UINT32);

        let mut cube = cube();
        let mut uploader = CountingUploader::default();
        cube.upload_or_get(&mut uploader).unwrap();
        assert_eq!(uploader.calls[1].0, 36 * 2);
    }

    #[test]
    fn cube_has_six_quads() {
        let cube = cube();
        assert_eq!(cube.vertices().len(), 24);
        assert_eq!(cube.index_count(), 36);
        assert!(cube.indices().iter().all(|&i| (i as usize) < cube.vertices().len()));
        for v in cube.vertices() {
            assert!(v.position.iter().all(|c| c.abs() == 0.5));
        }
    }
}
