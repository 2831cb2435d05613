// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering

use anyhow::{Context, Result};
use ash::vk;

/// Frame synchronization - one per frame slot
#[derive(Default)]
pub struct FrameSync {
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the very first wait returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_acquired = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-acquired semaphore")?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };

            Ok(Self {
                image_acquired,
                render_finished,
                in_flight_fence,
            })
        }
    }

    /// Whether the GPU has finished the last submission from this slot
    pub fn is_idle(&self, device: &ash::Device) -> Result<bool> {
        unsafe { device.get_fence_status(self.in_flight_fence) }
            .context("Failed to query in-flight fence")
    }

    /// Destroying null handles is a no-op, so a default value is safe here
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Current-frame index ring: visits `0..len` round-robin.
///
/// This index selects per-submission objects (semaphores, fence, command
/// buffer). It is unrelated to the image index returned by acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRing {
    current: usize,
    len: usize,
}

impl FrameRing {
    pub fn new(len: usize) -> Self {
        debug_assert!(len > 0, "frame ring needs at least one slot");
        Self { current: 0, len }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move to the next slot after a completed frame
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_starts_at_zero() {
        let ring = FrameRing::new(3);
        assert_eq!(ring.current(), 0);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn ring_is_round_robin_with_period_len() {
        for len in 1..=4 {
            let mut ring = FrameRing::new(len);
            let visited: Vec<usize> = (0..len * 3)
                .map(|_| {
                    let index = ring.current();
                    ring.advance();
                    index
                })
                .collect();

            let expected: Vec<usize> = (0..len).cycle().take(len * 3).collect();
            assert_eq!(visited, expected);
            assert_eq!(ring.current(), 0);
        }
    }

    #[test]
    fn consecutive_in_flight_frames_never_share_a_slot() {
        let len = 3;
        let mut ring = FrameRing::new(len);
        let mut window = std::collections::VecDeque::new();
        for _ in 0..20 {
            if window.len() == len {
                window.pop_front();
            }
            assert!(!window.contains(&ring.current()));
            window.push_back(ring.current());
            ring.advance();
        }
    }
}
