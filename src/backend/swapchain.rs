// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// one frame slot per image: view, framebuffer, command buffer, sync objects.
//
// Resize never overlaps old and new chains: the old one (and every slot) is
// destroyed after a device-idle wait, then the chain is built again.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::pipeline::{create_framebuffer, RenderPass};
use super::sync::FrameSync;
use super::{DeviceContext, Surface};
use crate::error::GpuError;

/// 8-bit formats we prefer, in order, paired with sRGB non-linear color space
const PREFERRED_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
];

/// Pick a surface format: first preferred one supported, else whatever the
/// surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&preferred| {
            formats.iter().copied().find(|f| {
                f.format == preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

/// Pick a present mode: the configured preference if supported, then
/// mailbox, then FIFO (always available).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preference
        .into_iter()
        .chain([vk::PresentModeKHR::MAILBOX])
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// A definite current extent wins; otherwise clamp the request into range.
pub fn resolve_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by a nonzero maximum (zero = unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        image_count.min(caps.max_image_count)
    } else {
        image_count
    }
}

/// Per-image resources plus the sync objects of one current-frame index
pub struct FrameSlot {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
}

impl FrameSlot {
    fn new(
        device: &DeviceContext,
        image: vk::Image,
        format: vk::Format,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut slot = Self {
            image,
            view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            command_buffer: vk::CommandBuffer::null(),
            sync: FrameSync::default(),
        };

        if let Err(e) = slot.build(device, format, render_pass, extent) {
            slot.destroy(device);
            return Err(e);
        }
        Ok(slot)
    }

    fn build(
        &mut self,
        device: &DeviceContext,
        format: vk::Format,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.view = unsafe { device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")?;

        self.framebuffer = create_framebuffer(&device.device, self.view, render_pass, extent)?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        self.command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate frame command buffer")?[0];

        self.sync = FrameSync::new(&device.device)?;
        Ok(())
    }

    // Null handles are skipped, so a partially built slot can be destroyed
    fn destroy(&self, device: &DeviceContext) {
        unsafe {
            if self.command_buffer != vk::CommandBuffer::null() {
                device
                    .device
                    .free_command_buffers(device.command_pool, &[self.command_buffer]);
            }
            if self.framebuffer != vk::Framebuffer::null() {
                device.device.destroy_framebuffer(self.framebuffer, None);
            }
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
            }
        }
        self.sync.destroy(&device.device);
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub slots: Vec<FrameSlot>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    present_preference: Option<vk::PresentModeKHR>,
    surface: Arc<Surface>,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceContext>,
        surface: Arc<Surface>,
        render_pass: &RenderPass,
        requested_extent: vk::Extent2D,
        present_preference: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let physical_device = device.physical_device();
        let caps = surface.capabilities(physical_device)?;
        let formats = surface.formats(physical_device)?;
        let present_modes = surface.present_modes(physical_device)?;

        let format = choose_surface_format(&formats).ok_or(GpuError::NoSurfaceFormats)?;
        if format.format != render_pass.format {
            return Err(GpuError::SurfaceFormatChanged {
                old: render_pass.format,
                new: format.format,
            }
            .into());
        }

        let present_mode = choose_present_mode(&present_modes, present_preference);
        let extent = resolve_extent(&caps, requested_extent);
        let image_count = choose_image_count(&caps);

        let swapchain_loader = khr::Swapchain::new(device.instance().handle(), &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever was built
        let mut chain = Self {
            swapchain,
            swapchain_loader,
            slots: Vec::new(),
            format,
            present_mode,
            extent,
            render_pass: render_pass.handle,
            present_preference,
            surface,
            device,
        };
        chain.build_slots()?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            chain.slots.len(),
            format.format,
            present_mode
        );

        Ok(chain)
    }

    /// The format a swapchain on this surface would use; the render pass is
    /// built against it before the first chain exists.
    pub fn probe_format(device: &DeviceContext, surface: &Surface) -> Result<vk::SurfaceFormatKHR> {
        let formats = surface.formats(device.physical_device())?;
        Ok(choose_surface_format(&formats).ok_or(GpuError::NoSurfaceFormats)?)
    }

    fn build_slots(&mut self) -> Result<()> {
        let images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }
            .context("Failed to get swapchain images")?;

        self.slots.reserve(images.len());
        for image in images {
            let slot = FrameSlot::new(
                &self.device,
                image,
                self.format.format,
                self.render_pass,
                self.extent,
            )?;
            self.slots.push(slot);
        }
        Ok(())
    }

    /// Tear this chain down and build one for `new_extent`.
    ///
    /// The render pass must be the one this chain was built with.
    pub fn resize(self, render_pass: &RenderPass, new_extent: vk::Extent2D) -> Result<Self> {
        debug_assert_eq!(self.render_pass, render_pass.handle);

        // No in-flight command buffer may still reference the old images
        self.device.wait_idle()?;

        let device = self.device.clone();
        let surface = self.surface.clone();
        let present_preference = self.present_preference;
        drop(self);

        Self::new(device, surface, render_pass, new_extent, present_preference)
    }

    /// Number of frame slots (= negotiated image count)
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        debug_assert!(index < self.slots.len(), "frame slot {} out of range", index);
        &self.slots[index]
    }

    /// Acquire next image for rendering, signalling `semaphore`.
    ///
    /// `Ok(None)` means the swapchain is out of date.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Option<(u32, bool)>> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Some((index, suboptimal))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen.
    ///
    /// Returns `true` when the swapchain should be rebuilt (suboptimal or out of date).
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(&self.device);
        }
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
