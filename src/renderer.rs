// =============================================================================
// RENDERER - the object the application loop talks to
// =============================================================================
//
// FRAME FLOW:
//   connect(window)                    adapter -> device -> swapchain
//   loop {
//     if begin_frame()? {              wait fence, acquire, begin render pass
//       draw_mesh(mesh, transform)?    lazy upload, bind, push MVP, draw
//       end_frame()?                   submit, present, advance slot
//     }
//   }
//   resize(w, h)                       rebuild swapchain only
//   disconnect()                       device idle, then reverse-order teardown
//
// Field order matters for Drop: everything that holds device handles is
// declared (and therefore dropped) before the device, surface and instance.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use crate::backend::frame::{self, AcquireOutcome};
use crate::backend::pipeline::{GraphicsPipeline, RenderPass};
use crate::backend::shader::ShaderModule;
use crate::backend::sync::FrameRing;
use crate::backend::{
    select_adapter, BufferRegistry, BufferUploader, DeviceContext, Instance, Surface,
    SurfaceBackend, Swapchain,
};
use crate::config::Config;
use crate::mesh::{Mesh, MeshBuffers, MeshIndex};

/// State of the frame between `begin_frame` and `end_frame`
#[derive(Clone, Copy, Debug)]
struct ActiveFrame {
    slot: usize,
    image_index: u32,
    command_buffer: vk::CommandBuffer,
    suboptimal: bool,
}

/// Frame bookkeeping that decides whether a call may touch the GPU.
///
/// Any failure once a slot's fence may have been reset drops the active frame
/// and schedules a swapchain rebuild; the rebuild recreates every fence
/// pre-signaled, so the next `begin_frame` cannot wait on one forever.
#[derive(Debug, Default)]
struct FrameState {
    active: Option<ActiveFrame>,
    /// Rebuild the swapchain before the next frame
    needs_resize: bool,
}

impl FrameState {
    /// Fails if a frame is already being recorded
    fn ensure_idle(&self, operation: &str) -> Result<()> {
        debug_assert!(self.active.is_none(), "{} called mid-frame", operation);
        if self.active.is_some() {
            anyhow::bail!("{} called while a frame is active", operation);
        }
        Ok(())
    }

    fn current(&self, operation: &str) -> Result<ActiveFrame> {
        debug_assert!(self.active.is_some(), "{} called without an active frame", operation);
        self.active
            .with_context(|| format!("{} called without an active frame", operation))
    }

    fn finish(&mut self, operation: &str) -> Result<ActiveFrame> {
        let frame = self.current(operation)?;
        self.active = None;
        Ok(frame)
    }

    fn abort(&mut self) {
        self.active = None;
        self.needs_resize = true;
    }

    /// Pass `result` through, aborting the frame on error
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Upload `mesh` if needed and return what to draw with.
    ///
    /// `None` for an empty mesh. A failed upload aborts the frame.
    fn prepare_draw<I: MeshIndex>(
        &mut self,
        mesh: &mut Mesh<I>,
        uploader: &mut impl BufferUploader,
    ) -> Result<Option<(ActiveFrame, MeshBuffers)>> {
        let frame = self.current("draw_mesh")?;
        if mesh.is_empty() {
            log::debug!("Skipping draw of empty mesh");
            return Ok(None);
        }
        let buffers = self.guard(mesh.upload_or_get(uploader))?;
        Ok(Some((frame, buffers)))
    }
}

pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // FRAME STATE
    // ─────────────────────────────────────────────────────────────────────────
    frame: FrameState,
    ring: FrameRing,
    extent: vk::Extent2D,
    /// Window has a zero-sized dimension; nothing is rendered
    is_minimized: bool,
    clear_color: [f32; 4],
    present_preference: Option<vk::PresentModeKHR>,

    // ─────────────────────────────────────────────────────────────────────────
    // GPU RESOURCES (dropped in this order)
    // ─────────────────────────────────────────────────────────────────────────
    buffers: BufferRegistry,
    pipeline: GraphicsPipeline,
    swapchain: Option<Swapchain>,
    render_pass: RenderPass,
    device: Arc<DeviceContext>,
    surface: Arc<Surface>,
    _instance: Arc<Instance>,
}

impl Renderer {
    /// Bring up the GPU for a window: instance, surface, adapter, device,
    /// render pass, pipeline and the first swapchain.
    ///
    /// Every failure here is fatal; the caller is expected to abort.
    pub fn connect<W>(config: &Config, window: &W, width: u32, height: u32) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Connecting renderer ({}x{})", width, height);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let backend = SurfaceBackend::from_display(display_handle)?;
        let instance = Instance::new(
            &config.window.title,
            &backend.required_extensions(),
            config.validation_enabled(),
        )?;

        // The window outlives the renderer: the caller keeps it alive until
        // after disconnect()
        let surface = unsafe { Surface::new(instance.clone(), backend, display_handle, window_handle)? };

        let adapter = select_adapter(&instance, Some(&surface))?;
        let device = DeviceContext::open(instance.clone(), adapter)?;

        let format = Swapchain::probe_format(&device, &surface)?;
        let render_pass = RenderPass::new(device.clone(), format.format)?;

        let vert = ShaderModule::from_file(&device.device, &config.shader_path("vert"))?;
        let frag = ShaderModule::from_file(&device.device, &config.shader_path("frag"))?;
        let pipeline = GraphicsPipeline::new(device.clone(), &render_pass, &vert, &frag)?;
        drop((vert, frag));

        let extent = vk::Extent2D { width, height };
        let present_preference = config.present_mode_preference();
        let is_minimized = width == 0 || height == 0;
        let swapchain = if is_minimized {
            None
        } else {
            Some(Swapchain::new(
                device.clone(),
                surface.clone(),
                &render_pass,
                extent,
                present_preference,
            )?)
        };

        let ring = FrameRing::new(swapchain.as_ref().map_or(1, Swapchain::len));

        log::info!("Renderer connected");

        Ok(Self {
            frame: FrameState::default(),
            ring,
            extent,
            is_minimized,
            clear_color: config.graphics.clear_color,
            present_preference,
            buffers: BufferRegistry::new(device.clone()),
            pipeline,
            swapchain,
            render_pass,
            device,
            surface,
            _instance: instance,
        })
    }

    // =========================================================================
    // FRAME LOOP
    // =========================================================================

    /// Start a frame. Returns `Ok(false)` when there is nothing to draw into
    /// this time around (minimized window, or the swapchain was just rebuilt);
    /// the caller then skips `draw_mesh`/`end_frame`.
    pub fn begin_frame(&mut self) -> Result<bool> {
        self.frame.ensure_idle("begin_frame")?;

        if self.is_minimized {
            return Ok(false);
        }

        if self.frame.needs_resize || self.swapchain.is_none() {
            self.rebuild_swapchain()?;
        }

        let slot = self.ring.current();
        let outcome = {
            let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
            frame::wait_and_acquire(&self.device, swapchain, slot)
        };

        let (image_index, suboptimal) = match self.frame.guard(outcome)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, rebuilding");
                self.rebuild_swapchain()?;
                return Ok(false);
            }
        };

        let recording = {
            let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
            frame::begin_recording(
                &self.device,
                swapchain,
                self.render_pass.handle,
                slot,
                image_index,
                self.clear_color,
            )
        };
        let command_buffer = self.frame.guard(recording)?;

        self.frame.active = Some(ActiveFrame {
            slot,
            image_index,
            command_buffer,
            suboptimal,
        });
        Ok(true)
    }

    /// Record one indexed draw of `mesh` with `transform` as its MVP matrix.
    ///
    /// The mesh is uploaded on its first draw and reuses those buffers after.
    /// On error the frame is dropped; the caller starts over with `begin_frame`.
    pub fn draw_mesh<I: MeshIndex>(&mut self, mesh: &mut Mesh<I>, transform: Mat4) -> Result<()> {
        let Some((active, buffers)) = self.frame.prepare_draw(mesh, &mut self.buffers)? else {
            return Ok(());
        };

        let handles = self.buffer_handles(buffers);
        let (vertex_buffer, index_buffer) = self.frame.guard(handles)?;

        let device = &self.device.device;
        let cmd = active.command_buffer;
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, index_buffer, 0, I::INDEX_TYPE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&transform),
            );
            device.cmd_draw_indexed(cmd, mesh.index_count(), 1, 0, 0, 0);
        }
        Ok(())
    }

    fn buffer_handles(&self, buffers: MeshBuffers) -> Result<(vk::Buffer, vk::Buffer)> {
        let vertex = self
            .buffers
            .get(buffers.vertex)
            .context("Mesh vertex buffer missing from registry")?;
        let index = self
            .buffers
            .get(buffers.index)
            .context("Mesh index buffer missing from registry")?;
        Ok((vertex.handle(), index.handle()))
    }

    /// Submit and present the active frame, then advance the frame slot.
    pub fn end_frame(&mut self) -> Result<()> {
        let active = self.frame.finish("end_frame")?;

        let presented = match self.swapchain.as_ref() {
            Some(swapchain) => frame::submit(&self.device, swapchain, active.slot).and_then(|()| {
                frame::present(&self.device, swapchain, active.slot, active.image_index)
            }),
            None => Err(anyhow::anyhow!("Swapchain not initialized")),
        };
        let needs_resize = self.frame.guard(presented)?;

        self.ring.advance();

        if needs_resize || active.suboptimal {
            log::debug!("Swapchain suboptimal or out of date on present");
            self.frame.needs_resize = true;
        }
        Ok(())
    }

    // =========================================================================
    // RESIZE
    // =========================================================================

    /// Window size changed. Only the swapchain and its frame slots are rebuilt.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.frame.ensure_idle("resize")?;
        log::info!("Resize requested: {}x{}", width, height);

        self.extent = vk::Extent2D { width, height };
        if width == 0 || height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;
        self.rebuild_swapchain()
    }

    /// On failure the renderer is left without a swapchain; the next
    /// `begin_frame` tries again.
    fn rebuild_swapchain(&mut self) -> Result<()> {
        self.frame.needs_resize = false;

        let rebuilt = match self.swapchain.take() {
            Some(old) => old.resize(&self.render_pass, self.extent),
            None => {
                self.device.wait_idle()?;
                Swapchain::new(
                    self.device.clone(),
                    self.surface.clone(),
                    &self.render_pass,
                    self.extent,
                    self.present_preference,
                )
            }
        };

        let swapchain = rebuilt.context("Failed to rebuild swapchain")?;
        self.ring = FrameRing::new(swapchain.len());
        self.swapchain = Some(swapchain);
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// Current-frame index of the next (or active) frame
    pub fn current_slot(&self) -> usize {
        self.ring.current()
    }

    pub fn is_minimized(&self) -> bool {
        self.is_minimized
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Wait for the GPU and release everything in reverse creation order.
    pub fn disconnect(self) -> Result<()> {
        log::info!("Disconnecting renderer...");
        self.device.wait_idle()?;
        drop(self);
        log::info!("Cleanup complete");
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Nothing below may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferId;
    use crate::mesh::{MeshGpuState, Vertex};

    #[derive(Default)]
    struct CountingUploader {
        calls: usize,
    }

    impl BufferUploader for CountingUploader {
        fn upload(&mut self, _data: &[u8], _usage: vk::BufferUsageFlags) -> Result<BufferId> {
            self.calls += 1;
            Ok(BufferId(self.calls as u64))
        }
    }

    struct FailingUploader;

    impl BufferUploader for FailingUploader {
        fn upload(&mut self, _data: &[u8], _usage: vk::BufferUsageFlags) -> Result<BufferId> {
            anyhow::bail!("out of device memory")
        }
    }

    fn recording(slot: usize, image_index: u32) -> FrameState {
        FrameState {
            active: Some(ActiveFrame {
                slot,
                image_index,
                command_buffer: vk::CommandBuffer::null(),
                suboptimal: false,
            }),
            needs_resize: false,
        }
    }

    fn triangle() -> Mesh<u16> {
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
    fn failed_upload_ends_the_frame_and_schedules_rebuild() {
        let mut state = recording(0, 1);
        let mut mesh = triangle();

        assert!(state.prepare_draw(&mut mesh, &mut FailingUploader).is_err());

        assert!(state.active.is_none());
        assert!(state.needs_resize);
        assert_eq!(mesh.gpu_state(), MeshGpuState::NotUploaded);
        // The next frame can start
        assert!(state.ensure_idle("begin_frame").is_ok());
    }

    #[test]
    fn successful_draw_keeps_the_frame_open() {
        let mut state = recording(2, 0);
        let mut mesh = triangle();
        let mut uploader = CountingUploader::default();

        let (active, _) = state.prepare_draw(&mut mesh, &mut uploader).unwrap().unwrap();
        assert_eq!(active.slot, 2);
        assert_eq!(active.image_index, 0);

        state.prepare_draw(&mut mesh, &mut uploader).unwrap().unwrap();
        assert_eq!(uploader.calls, 2);
        assert!(state.active.is_some());
        assert!(!state.needs_resize);
    }

    #[test]
    fn empty_mesh_is_skipped_without_upload() {
        let mut state = recording(0, 0);
        let mut mesh: Mesh<u32> = Mesh::new(Vec::new(), Vec::new());
        let mut uploader = CountingUploader::default();

        assert!(state.prepare_draw(&mut mesh, &mut uploader).unwrap().is_none());
        assert_eq!(uploader.calls, 0);
        assert!(state.active.is_some());
    }

    #[test]
    fn finishing_returns_the_frame_and_goes_idle() {
        let mut state = recording(1, 2);
        let active = state.finish("end_frame").unwrap();
        assert_eq!((active.slot, active.image_index), (1, 2));
        assert!(state.ensure_idle("begin_frame").is_ok());
        assert!(!state.needs_resize);
    }

    #[test]
    fn failed_step_before_recording_schedules_rebuild() {
        let mut state = FrameState::default();
        let acquired: Result<u32> = Err(anyhow::anyhow!("surface lost"));

        assert!(state.guard(acquired).is_err());
        assert!(state.needs_resize);
        assert!(state.guard(Ok(7)).is_ok());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "resize called mid-frame"))]
    fn resize_is_refused_mid_frame() {
        let state = recording(0, 0);
        assert!(state.ensure_idle("resize").is_err());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "draw_mesh called without an active frame"))]
    fn draw_without_frame_is_refused() {
        let mut state = FrameState::default();
        let mut uploader = CountingUploader::default();
        assert!(state.prepare_draw(&mut triangle(), &mut uploader).is_err());
        assert_eq!(uploader.calls, 0);
    }
}
