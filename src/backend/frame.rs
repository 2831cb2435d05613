// Per-frame synchronization cycle.
//
// For current-frame index `c` and acquired image index `i`:
//
// 1. wait   slot[c].in_flight_fence         (GPU done with slot c's last submit)
// 2. reset  slot[c].in_flight_fence
// 3. acquire image i, signalling slot[c].image_acquired
// 4. record slot[c].command_buffer into framebuffer[i]
// 5. submit waiting image_acquired @ COLOR_ATTACHMENT_OUTPUT,
//           signalling render_finished and in_flight_fence
// 6. present image i, waiting render_finished
// 7. c = (c + 1) mod N
//
// Sync objects and the command buffer follow `c`; framebuffer and image
// follow `i`. The fence wait bounds CPU run-ahead to `N` frames.

use anyhow::{Context, Result};
use ash::vk;

use super::swapchain::{FrameSlot, Swapchain};
use super::DeviceContext;

/// Result of steps 1-3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image `image_index` is ours; `suboptimal` asks for a rebuild after present
    Acquired { image_index: u32, suboptimal: bool },
    /// Surface changed under us; rebuild the swapchain and skip this frame
    OutOfDate,
}

/// Wait on slot `slot`'s fence, reset it and acquire the next image.
///
/// On `OutOfDate` the fence stays unsignaled; the rebuild that must follow
/// recreates every slot's fence pre-signaled.
pub fn wait_and_acquire(
    device: &DeviceContext,
    swapchain: &Swapchain,
    slot: usize,
) -> Result<AcquireOutcome> {
    let sync = &swapchain.slot(slot).sync;
    let fences = [sync.in_flight_fence];

    unsafe {
        device
            .device
            .wait_for_fences(&fences, true, u64::MAX)
            .context("Failed waiting for in-flight fence")?;
        device
            .device
            .reset_fences(&fences)
            .context("Failed to reset in-flight fence")?;
    }

    Ok(match swapchain.acquire_next_image(sync.image_acquired)? {
        Some((image_index, suboptimal)) => AcquireOutcome::Acquired {
            image_index,
            suboptimal,
        },
        None => AcquireOutcome::OutOfDate,
    })
}

/// Command buffer of current-frame slot `slot` and framebuffer of acquired
/// image `image_index`. The two indices are independent.
pub fn recording_targets(
    slots: &[FrameSlot],
    slot: usize,
    image_index: u32,
) -> (vk::CommandBuffer, vk::Framebuffer) {
    let image_index = image_index as usize;
    debug_assert!(slot < slots.len(), "frame slot {} out of range", slot);
    debug_assert!(image_index < slots.len(), "image {} out of range", image_index);
    (slots[slot].command_buffer, slots[image_index].framebuffer)
}

/// Reset slot `slot`'s command buffer and open the render pass on image
/// `image_index`'s framebuffer, clearing to `clear_color`.
pub fn begin_recording(
    device: &DeviceContext,
    swapchain: &Swapchain,
    render_pass: vk::RenderPass,
    slot: usize,
    image_index: u32,
    clear_color: [f32; 4],
) -> Result<vk::CommandBuffer> {
    let (cmd, framebuffer) = recording_targets(&swapchain.slots, slot, image_index);
    let extent = swapchain.extent;

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    }];

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(&clear_values);

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };

    unsafe {
        device
            .device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset frame command buffer")?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin frame command buffer")?;

        device
            .device
            .cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.device.cmd_set_scissor(cmd, 0, &[scissor]);
    }

    Ok(cmd)
}

/// Close the render pass and submit slot `slot`'s command buffer.
pub fn submit(device: &DeviceContext, swapchain: &Swapchain, slot: usize) -> Result<()> {
    let frame = swapchain.slot(slot);
    let cmd = frame.command_buffer;

    unsafe {
        device.device.cmd_end_render_pass(cmd);
        device
            .device
            .end_command_buffer(cmd)
            .context("Failed to end frame command buffer")?;
    }

    let wait_semaphores = [frame.sync.image_acquired];
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let signal_semaphores = [frame.sync.render_finished];
    let command_buffers = [cmd];

    let submit_info = vk::SubmitInfo::builder()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(&command_buffers)
        .signal_semaphores(&signal_semaphores);

    unsafe {
        device
            .device
            .queue_submit(
                device.graphics_queue,
                &[submit_info.build()],
                frame.sync.in_flight_fence,
            )
            .context("Failed to submit frame")?;
    }
    Ok(())
}

/// Present image `image_index` once slot `slot`'s rendering has finished.
///
/// Returns `true` when the swapchain should be rebuilt.
pub fn present(
    device: &DeviceContext,
    swapchain: &Swapchain,
    slot: usize,
    image_index: u32,
) -> Result<bool> {
    let render_finished = swapchain.slot(slot).sync.render_finished;
    swapchain.present(device.graphics_queue, image_index, render_finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::FrameSync;
    use ash::vk::Handle;

    fn slots(count: u64) -> Vec<FrameSlot> {
        (0..count)
            .map(|n| FrameSlot {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                framebuffer: vk::Framebuffer::from_raw(100 + n),
                command_buffer: vk::CommandBuffer::from_raw(200 + n),
                sync: FrameSync::default(),
            })
            .collect()
    }

    #[test]
    fn command_buffer_follows_slot_and_framebuffer_follows_image() {
        let slots = slots(3);
        let (cmd, framebuffer) = recording_targets(&slots, 0, 2);
        assert_eq!(cmd.as_raw(), 200);
        assert_eq!(framebuffer.as_raw(), 102);

        let (cmd, framebuffer) = recording_targets(&slots, 2, 1);
        assert_eq!(cmd.as_raw(), 202);
        assert_eq!(framebuffer.as_raw(), 101);
    }

    #[test]
    fn matching_indices_pick_the_same_slot() {
        let slots = slots(2);
        let (cmd, framebuffer) = recording_targets(&slots, 1, 1);
        assert_eq!(cmd.as_raw(), 201);
        assert_eq!(framebuffer.as_raw(), 101);
    }
}
