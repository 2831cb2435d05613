// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Logical device + one queue per distinct family
// - Compute/transfer queues alias graphics when no family of their own exists
// - The shared command pool (graphics family, individually resettable)
// - One-shot blocking submissions for uploads

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::adapter::AdapterCandidate;
use super::Instance;

/// Opened device, its queues and the command pool every frame allocates from.
///
/// Shared read-only by all frame slots and the uploader; destroyed once, after
/// a device-idle wait, when the last `Arc` goes away.
pub struct DeviceContext {
    pub device: ash::Device,
    pub adapter: AdapterCandidate,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub compute_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
    pub graphics_queue_family: u32,

    pub command_pool: vk::CommandPool,

    instance: Arc<Instance>,
}

impl DeviceContext {
    /// Open a logical device on the selected adapter.
    ///
    /// Failure here is an unrecoverable startup error.
    pub fn open(instance: Arc<Instance>, adapter: AdapterCandidate) -> Result<Arc<Self>> {
        let families = adapter.queue_families;
        let graphics_queue_family = families
            .graphics
            .context("Adapter has no graphics queue family")?;

        // One queue per distinct family, all at full priority
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut extensions = Vec::new();
        if adapter.needs_swapchain() {
            extensions.push(khr::Swapchain::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let queue_or_graphics = |family: Option<u32>| match family {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => graphics_queue,
        };
        let compute_queue = queue_or_graphics(families.compute);
        let transfer_queue = queue_or_graphics(families.transfer);

        // RESET: per-frame command buffers are reset and re-recorded individually
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e).context("Failed to create command pool");
            }
        };

        log::info!(
            "Opened logical device with {} queue famil{}",
            queue_create_infos.len(),
            if queue_create_infos.len() == 1 { "y" } else { "ies" }
        );

        Ok(Arc::new(Self {
            device,
            adapter,
            graphics_queue,
            compute_queue,
            transfer_queue,
            graphics_queue_family,
            command_pool,
            instance,
        }))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.adapter.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.adapter.memory_properties
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed waiting for device idle")?;
        Ok(())
    }

    /// Record commands into a throwaway command buffer, submit them on the
    /// graphics queue and block until the queue is idle.
    pub fn submit_one_time<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-time command buffer")?;
        let cmd = command_buffers[0];

        let result = self.record_and_wait(cmd, record);

        unsafe {
            self.device
                .free_command_buffers(self.command_pool, &command_buffers);
        }
        result
    }

    fn record_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin one-time command buffer")?;
            record(&self.device, cmd);
            self.device
                .end_command_buffer(cmd)
                .context("Failed to end one-time command buffer")?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-time command buffer")?;
            self.device
                .queue_wait_idle(self.graphics_queue)
                .context("Failed waiting for graphics queue")?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("{:#}", e);
        }

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}
