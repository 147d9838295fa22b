//! Main renderer orchestration.
//!
//! [`Renderer`] brings up Vulkan for a window and composes the resource
//! registries, the Vulkan frame backend and the [`FramePacer`] behind a small
//! frame API.
//!
//! # Resource Destruction Order
//!
//! 1. Wait for every frame in flight
//! 2. Release all registered textures and buffers
//! 3. Destroy the pacer's fences, semaphores and command buffers
//! 4. Destroy the swapchain and command pool
//! 5. Destroy the surface
//! 6. Destroy the device
//! 7. Destroy the instance
//!
//! ManuallyDrop is used to enforce this order.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use glam::Vec4;
use tracing::{debug, error, info};

use kiln_core::{Registry, RendererConfig, Rid};
use kiln_platform::{Surface, Window};
use kiln_rhi::buffer::{Buffer, BufferUsage};
use kiln_rhi::command::CommandBuffer;
use kiln_rhi::device::Device;
use kiln_rhi::instance::Instance;
use kiln_rhi::physical_device::select_physical_device;
use kiln_rhi::{
    BoundProgram, ImageState, RhiError, RhiResult, StateTransition, Texture, TextureDesc,
    TextureOps,
};

use crate::backend::VulkanFrameBackend;
use crate::frame_pacer::{FrameContext, FramePacer, FrameStatus, PacingConfig};
use crate::render_graph::RenderGraph;

/// Owns the GPU and everything drawn with it.
pub struct Renderer {
    pacer: ManuallyDrop<FramePacer<VulkanFrameBackend>>,
    backend: ManuallyDrop<VulkanFrameBackend>,
    textures: Registry<Texture>,
    buffers: Registry<Buffer>,
    program: Option<BoundProgram>,
    surface: ManuallyDrop<Surface>,
    device: ManuallyDrop<Arc<Device>>,
    instance: ManuallyDrop<Instance>,
    output: OutputState,
}

/// What [`Renderer::render`] must do before recording a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputAction {
    Render,
    /// The window has no area; nothing can be presented.
    Skip,
    Rebuild(vk::Extent2D),
}

/// Whether the swapchain still matches the window.
#[derive(Clone, Copy, Debug)]
struct OutputState {
    /// Size requested by the window; applied at the next rebuild.
    requested_extent: vk::Extent2D,
    stale: bool,
}

impl OutputState {
    fn new(extent: vk::Extent2D) -> Self {
        Self {
            requested_extent: extent,
            stale: false,
        }
    }

    /// Returns false if the output already matches `extent`.
    fn resize(&mut self, extent: vk::Extent2D) -> bool {
        if extent == self.requested_extent && !self.stale {
            return false;
        }
        self.requested_extent = extent;
        self.stale = true;
        true
    }

    fn observe(&mut self, status: FrameStatus) {
        if status == FrameStatus::NeedsRebuild {
            self.stale = true;
        }
    }

    fn next_action(&self) -> OutputAction {
        if !self.stale {
            OutputAction::Render
        } else if is_zero_area(self.requested_extent) {
            OutputAction::Skip
        } else {
            OutputAction::Rebuild(self.requested_extent)
        }
    }

    fn rebuilt(&mut self) {
        self.stale = false;
    }
}

impl Renderer {
    /// Bring up Vulkan for `window`.
    ///
    /// Creates one offscreen render target per frame slot.
    pub fn new(window: &Window, config: &RendererConfig) -> RhiResult<Self> {
        let extent = window.extent();
        info!(
            "Initializing Vulkan renderer ({}x{})",
            extent.width, extent.height
        );

        let surface_extensions = window
            .required_extensions()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;
        let instance = Instance::new(config.validation, &surface_extensions)?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let physical_device_info =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical_device_info)?;

        let pacing = PacingConfig::from(config);
        let mut backend = VulkanFrameBackend::new(
            &instance,
            device.clone(),
            surface.handle(),
            extent,
            pacing.frames_in_flight as u32,
        )?;

        let mut textures = Registry::with_capacity(config.registry_capacity);
        let buffers = Registry::with_capacity(config.registry_capacity);

        let target_desc = TextureDesc::render_target(backend.extent());
        let mut render_targets = Vec::with_capacity(pacing.frames_in_flight);
        for _ in 0..pacing.frames_in_flight {
            render_targets.push(textures.allocate(Texture::new(device.clone(), &target_desc)?));
        }

        let pacer = FramePacer::new(&mut backend, pacing, &render_targets)?;

        info!("Renderer initialized");

        Ok(Self {
            pacer: ManuallyDrop::new(pacer),
            backend: ManuallyDrop::new(backend),
            textures,
            buffers,
            program: None,
            surface: ManuallyDrop::new(surface),
            device: ManuallyDrop::new(device),
            instance: ManuallyDrop::new(instance),
            output: OutputState::new(extent),
        })
    }

    /// Render and present one frame.
    ///
    /// Returns [`FrameStatus::NeedsRebuild`] when the frame was skipped or the
    /// output went stale; the rebuild happens at the start of the next call.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the renderer: fence timeouts, device loss and
    /// recording failures all leave frame slots in an unknown state.
    pub fn render(&mut self, graph: &RenderGraph) -> RhiResult<FrameStatus> {
        match self.output.next_action() {
            OutputAction::Render => {}
            OutputAction::Skip => return Ok(FrameStatus::NeedsRebuild),
            OutputAction::Rebuild(extent) => self.rebuild_output(extent)?,
        }

        let textures = &mut self.textures;
        let program = self.program.as_ref();
        let status = self.pacer.render_frame(&mut self.backend, |backend, ctx| {
            record_frame(backend, textures, program, graph, ctx)
        })?;

        self.output.observe(status);
        Ok(status)
    }

    /// Note a new window size. The swapchain and render targets are rebuilt
    /// by the next [`Renderer::render`].
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.output.resize(vk::Extent2D { width, height }) {
            debug!("Resize requested: {}x{}", width, height);
        }
    }

    fn rebuild_output(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.backend.rebuild(&self.instance, self.surface.handle(), extent)?;
        self.pacer.rebuild_image_sync(&mut self.backend)?;

        let desc = TextureDesc::render_target(self.backend.extent());
        let device = &self.device;
        self.pacer.replace_render_targets(&mut self.textures, || {
            Texture::new(Arc::clone(device), &desc)
        })?;

        self.output.rebuilt();
        info!(
            "Output rebuilt at {}x{}",
            desc.extent.width, desc.extent.height
        );
        Ok(())
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Create a texture and register it.
    pub fn create_texture(&mut self, desc: &TextureDesc) -> RhiResult<Rid> {
        let texture = Texture::new(Arc::clone(&self.device), desc)?;
        Ok(self.textures.allocate(texture))
    }

    /// Create a buffer of `size` bytes and register it.
    pub fn create_buffer(&mut self, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Rid> {
        let buffer = Buffer::new(Arc::clone(&self.device), usage, size)?;
        Ok(self.buffers.allocate(buffer))
    }

    /// # Panics
    ///
    /// Panics on a released or stale handle.
    #[track_caller]
    pub fn texture(&self, rid: Rid) -> &Texture {
        self.textures.get(rid)
    }

    #[track_caller]
    pub fn texture_mut(&mut self, rid: Rid) -> &mut Texture {
        self.textures.get_mut(rid)
    }

    #[track_caller]
    pub fn buffer(&self, rid: Rid) -> &Buffer {
        self.buffers.get(rid)
    }

    /// Release a texture once every frame in flight has completed.
    ///
    /// # Panics
    ///
    /// Panics on a released or stale handle, or if `rid` is one of the frame
    /// render targets.
    #[track_caller]
    pub fn release_texture(&mut self, rid: Rid) -> RhiResult<()> {
        if self.pacer.render_targets().any(|target| target == rid) {
            panic!("Renderer::release_texture: {rid} is a frame render target");
        }
        self.pacer.wait_idle(&mut self.backend)?;
        drop(self.textures.release(rid));
        Ok(())
    }

    /// Release a buffer once every frame in flight has completed.
    #[track_caller]
    pub fn release_buffer(&mut self, rid: Rid) -> RhiResult<()> {
        self.pacer.wait_idle(&mut self.backend)?;
        drop(self.buffers.release(rid));
        Ok(())
    }

    /// Attach a program dispatched over the render target every frame.
    ///
    /// Returns the previously attached program. Its pipeline may still be in
    /// use by frames in flight.
    pub fn set_program(&mut self, program: Option<BoundProgram>) -> Option<BoundProgram> {
        std::mem::replace(&mut self.program, program)
    }

    /// Block until every frame in flight has completed.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.pacer.wait_idle(&mut self.backend)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.backend.extent()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.backend.format()
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.pacer.frame_count()
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

/// Record one frame: clear the slot's render target, run the attached
/// program and the graph, then blit into the acquired image.
fn record_frame(
    backend: &mut VulkanFrameBackend,
    textures: &mut Registry<Texture>,
    program: Option<&BoundProgram>,
    graph: &RenderGraph,
    ctx: &FrameContext<'_, VulkanFrameBackend>,
) -> RhiResult<()> {
    let cmd: &CommandBuffer = ctx.commands;
    let target = textures.get_mut(ctx.render_target);

    target.discard_contents();
    target.transition(cmd, StateTransition::to(ImageState::TransferDst))?;
    target.clear(cmd, animated_clear_color(ctx.frame))?;

    if let Some(program) = program
        && program.is_compute()
    {
        target.transition(cmd, StateTransition::to(ImageState::General))?;
        program.record(cmd, target.extent());
    }

    graph.execute(cmd);

    target.transition(cmd, StateTransition::to(ImageState::TransferSrc))?;

    let presentable = backend.presentable_mut(ctx.image_index)?;
    presentable.discard_contents();
    // Chain with the acquire wait, which blocks transfers only.
    presentable.transition(
        cmd,
        StateTransition::to(ImageState::TransferDst).src_stage(vk::PipelineStageFlags2::ALL_TRANSFER),
    )?;
    target.blit_to(cmd, presentable)?;
    presentable.transition(cmd, StateTransition::to(ImageState::PresentSource))?;

    Ok(())
}

/// Clear color pulsing in blue with a period of about 628 frames.
fn animated_clear_color(frame: u64) -> Vec4 {
    let flash = ((frame as f64 / 100.0).sin() + 1.0) * 0.5;
    Vec4::new(0.0, 0.0, flash as f32, 1.0)
}

fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

impl Drop for Renderer {
    fn drop(&mut self) {
        info!("Destroying renderer after {} frames", self.pacer.frame_count());

        if let Err(e) = self.pacer.wait_idle(&mut self.backend) {
            error!("Failed to wait for frames in flight: {}", e);
        }
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle: {}", e);
        }

        self.textures.clear();
        self.buffers.clear();

        unsafe {
            ManuallyDrop::drop(&mut self.pacer);
            ManuallyDrop::drop(&mut self.backend);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_color_starts_at_half_blue() {
        let color = animated_clear_color(0);
        assert_eq!(color, Vec4::new(0.0, 0.0, 0.5, 1.0));
    }

    #[test]
    fn test_clear_color_stays_in_range() {
        for frame in (0..10_000u64).step_by(7) {
            let color = animated_clear_color(frame);
            assert!((0.0..=1.0).contains(&color.z), "frame {}: {}", frame, color.z);
            assert_eq!(color.w, 1.0);
            assert_eq!(color.x, 0.0);
        }
        // sin(pi / 2) peak near frame 157
        assert!(animated_clear_color(157).z > 0.99);
    }

    #[test]
    fn test_zero_area() {
        assert!(is_zero_area(vk::Extent2D {
            width: 0,
            height: 10
        }));
        assert!(!is_zero_area(vk::Extent2D {
            width: 1,
            height: 1
        }));
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_output_renders_until_resized() {
        let mut output = OutputState::new(extent(800, 600));
        assert_eq!(output.next_action(), OutputAction::Render);

        assert!(!output.resize(extent(800, 600)));
        assert_eq!(output.next_action(), OutputAction::Render);

        assert!(output.resize(extent(1024, 768)));
        assert_eq!(output.next_action(), OutputAction::Rebuild(extent(1024, 768)));

        output.rebuilt();
        assert_eq!(output.next_action(), OutputAction::Render);
    }

    #[test]
    fn test_output_rebuilds_at_latest_size() {
        let mut output = OutputState::new(extent(800, 600));
        output.resize(extent(1024, 768));
        output.resize(extent(640, 480));
        assert_eq!(output.next_action(), OutputAction::Rebuild(extent(640, 480)));

        // Returning to the current size still rebuilds while stale.
        assert!(output.resize(extent(800, 600)));
        assert_eq!(output.next_action(), OutputAction::Rebuild(extent(800, 600)));
    }

    #[test]
    fn test_minimized_output_skips_frames() {
        let mut output = OutputState::new(extent(800, 600));
        output.resize(extent(0, 0));
        assert_eq!(output.next_action(), OutputAction::Skip);
        assert_eq!(output.next_action(), OutputAction::Skip);

        output.resize(extent(800, 600));
        assert_eq!(output.next_action(), OutputAction::Rebuild(extent(800, 600)));
    }

    #[test]
    fn test_stale_frame_schedules_rebuild() {
        let mut output = OutputState::new(extent(800, 600));
        output.observe(FrameStatus::Presented {
            frame: 0,
            slot: 0,
            image_index: 0,
        });
        assert_eq!(output.next_action(), OutputAction::Render);

        output.observe(FrameStatus::NeedsRebuild);
        assert_eq!(output.next_action(), OutputAction::Rebuild(extent(800, 600)));
    }

    #[test]
    fn test_renderer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Renderer>();
    }
}
