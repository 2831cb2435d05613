// Host to device-local buffer uploads.
//
// Uploads go through a transient host-visible staging buffer and a one-shot
// copy on the graphics queue, then block until the queue is idle. They happen
// at mesh load time, never per frame, so the stall is acceptable.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::memory::RawBuffer;
use super::DeviceContext;
use crate::error::GpuError;

const STAGING_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Identifier of a GPU buffer owned by a [`BufferRegistry`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// A device-local buffer holding uploaded data
#[derive(Debug)]
pub struct GpuBuffer {
    pub id: BufferId,
    pub raw: RawBuffer,
    pub usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.raw.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.raw.size
    }
}

/// Copy `data` into a new device-local buffer.
///
/// `usage` is extended with `TRANSFER_DST`. The staging buffer is freed before
/// returning, whether or not the copy succeeded.
pub fn upload(
    device: &DeviceContext,
    id: BufferId,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<GpuBuffer> {
    if data.is_empty() {
        return Err(GpuError::EmptyUpload.into());
    }
    let size = data.len() as vk::DeviceSize;

    let staging = RawBuffer::new(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        STAGING_MEMORY,
    )
    .context("Failed to create staging buffer")?;

    let usage = usage | vk::BufferUsageFlags::TRANSFER_DST;
    let result = stage_and_copy(device, &staging, data, usage);
    staging.destroy(device);
    let raw = result?;

    log::debug!("Uploaded {} bytes into buffer {:?} ({:?})", size, id, usage);

    Ok(GpuBuffer { id, raw, usage })
}

fn stage_and_copy(
    device: &DeviceContext,
    staging: &RawBuffer,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<RawBuffer> {
    staging.write(device, data)?;

    let destination = RawBuffer::new(
        device,
        staging.size,
        usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("Failed to create device-local buffer")?;

    if let Err(e) = copy_buffer(device, staging.buffer, destination.buffer, staging.size) {
        destination.destroy(device);
        return Err(e);
    }

    Ok(destination)
}

fn copy_buffer(
    device: &DeviceContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    device.submit_one_time(|dev, cmd| unsafe {
        dev.cmd_copy_buffer(cmd, src, dst, &[region]);
    })
}

/// Read a buffer back to the host through a staging buffer.
///
/// The buffer must have been uploaded with `TRANSFER_SRC` in its usage.
pub fn download(device: &DeviceContext, buffer: &GpuBuffer) -> Result<Vec<u8>> {
    debug_assert!(buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));

    let readback = RawBuffer::new(
        device,
        buffer.size(),
        vk::BufferUsageFlags::TRANSFER_DST,
        STAGING_MEMORY,
    )
    .context("Failed to create readback buffer")?;

    let result = copy_buffer(device, buffer.handle(), readback.buffer, buffer.size())
        .and_then(|()| readback.read(device));
    readback.destroy(device);
    result
}

/// Anything that can turn host bytes into a GPU buffer id.
pub trait BufferUploader {
    fn upload(&mut self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<BufferId>;
}

/// Owner of every uploaded buffer, keyed by id.
///
/// Buffers live until the registry is cleared or dropped; by then the caller
/// has waited for the device to go idle.
pub struct BufferRegistry {
    buffers: HashMap<BufferId, GpuBuffer>,
    next_id: u64,
    device: Arc<DeviceContext>,
}

impl BufferRegistry {
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 0,
            device,
        }
    }

    pub fn get(&self, id: BufferId) -> Option<&GpuBuffer> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Read back a registered buffer
    pub fn download(&self, id: BufferId) -> Result<Vec<u8>> {
        let buffer = self
            .get(id)
            .with_context(|| format!("Unknown buffer {:?}", id))?;
        download(&self.device, buffer)
    }

    /// Destroy every buffer. The device must be idle.
    pub fn clear(&mut self) {
        for (_, buffer) in self.buffers.drain() {
            buffer.raw.destroy(&self.device);
        }
    }
}

impl BufferUploader for BufferRegistry {
    fn upload(&mut self, data: &[u8], usage: vk::BufferUsageFlags) -> Result<BufferId> {
        let id = BufferId(self.next_id);
        let buffer = upload(&self.device, id, data, usage)?;
        self.next_id += 1;
        self.buffers.insert(id, buffer);
        Ok(id)
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
        self.clear();
    }
}
