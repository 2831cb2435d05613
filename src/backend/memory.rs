// Memory types and raw buffer allocation
//
// Every buffer gets its own `vk::DeviceMemory`; there is no sub-allocation.

use anyhow::{Context, Result};
use ash::vk;

use super::DeviceContext;
use crate::error::GpuError;

/// First memory type allowed by `type_bits` whose flags include `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let allowed = type_bits & (1 << i) != 0;
        allowed
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// A buffer with its dedicated memory
#[derive(Debug)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl RawBuffer {
    /// Create a buffer and bind freshly allocated memory with `properties`
    pub fn new(
        device: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        match Self::allocate_and_bind(device, buffer, properties) {
            Ok(memory) => Ok(Self {
                buffer,
                memory,
                size,
            }),
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn allocate_and_bind(
        device: &DeviceContext,
        buffer: vk::Buffer,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            device.memory_properties(),
            requirements.memory_type_bits,
            properties,
        )
        .ok_or(GpuError::NoMatchingMemoryType {
            type_bits: requirements.memory_type_bits,
            flags: properties,
        })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe { device.device.free_memory(memory, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(memory)
    }

    /// Copy bytes into host-visible memory
    pub fn write(&self, device: &DeviceContext, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() as vk::DeviceSize <= self.size);
        unsafe {
            let ptr = device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy the whole buffer out of host-visible memory
    pub fn read(&self, device: &DeviceContext) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];
        unsafe {
            let ptr = device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *const u8;
            ptr.copy_to_nonoverlapping(out.as_mut_ptr(), out.len());
            device.device.unmap_memory(self.memory);
        }
        Ok(out)
    }

    /// Release the buffer and its memory. The GPU must be done with it.
    pub fn destroy(&self, device: &DeviceContext) {
        unsafe {
            device.device.destroy_buffer(self.buffer, None);
            device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_with_superset_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
            HOST,
        ]);

        assert_eq!(find_memory_type(&props, 0b1111, HOST), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn respects_resource_type_bits() {
        let props = memory_properties(&[HOST, HOST]);
        assert_eq!(find_memory_type(&props, 0b10, HOST), Some(1));
        assert_eq!(find_memory_type(&props, 0b00, HOST), None);
    }

    #[test]
    fn no_match_yields_none() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&props, u32::MAX, HOST), None);
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST;
        assert_eq!(find_memory_type(&props, u32::MAX, HOST), None);
    }
}
