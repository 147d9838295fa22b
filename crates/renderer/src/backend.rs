//! Vulkan implementation of [`FrameBackend`].
//!
//! Owns the command pool, the swapchain and one presentable [`Texture`] per
//! swapchain image so the blit target goes through the same state tracking as
//! every other texture.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use kiln_rhi::command::{CommandBuffer, CommandPool};
use kiln_rhi::device::Device;
use kiln_rhi::instance::Instance;
use kiln_rhi::swapchain::Swapchain;
use kiln_rhi::sync::{Fence, Semaphore};
use kiln_rhi::{AcquireOutcome, PresentOutcome, RhiError, RhiResult, Texture};
use tracing::debug;

use crate::frame_pacer::FrameBackend;

/// Frame backend driving a real device and swapchain.
pub struct VulkanFrameBackend {
    // Wrappers before the swapchain that owns their images.
    presentables: Vec<Texture>,
    swapchain: Swapchain,
    command_pool: CommandPool,
    device: Arc<Device>,
}

impl VulkanFrameBackend {
    /// Create the command pool and a swapchain with at least `min_images`
    /// images.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
        min_images: u32,
    ) -> RhiResult<Self> {
        let command_pool = CommandPool::new(device.clone(), device.queue_families().graphics()?)?;
        let swapchain = Swapchain::new(instance, device.clone(), surface, extent, min_images)?;
        let presentables = wrap_images(&device, &swapchain);

        Ok(Self {
            presentables,
            swapchain,
            command_pool,
            device,
        })
    }

    /// Recreate the swapchain for `extent`.
    ///
    /// Waits for the device to go idle. Per-image signals held by the pacer
    /// must be rebuilt afterwards.
    pub fn rebuild(
        &mut self,
        instance: &Instance,
        surface: vk::SurfaceKHR,
        extent: vk::Extent2D,
    ) -> RhiResult<()> {
        self.presentables.clear();
        self.swapchain.recreate(instance, surface, extent)?;
        self.presentables = wrap_images(&self.device, &self.swapchain);
        Ok(())
    }

    /// Presentable texture for `image_index`.
    pub fn presentable_mut(&mut self, image_index: u32) -> RhiResult<&mut Texture> {
        let count = self.presentables.len();
        self.presentables
            .get_mut(image_index as usize)
            .ok_or_else(|| {
                RhiError::SwapchainError(format!(
                    "image index {} out of range ({} images)",
                    image_index, count
                ))
            })
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

fn wrap_images(device: &Arc<Device>, swapchain: &Swapchain) -> Vec<Texture> {
    swapchain
        .images()
        .iter()
        .zip(swapchain.image_views())
        .map(|(&image, &view)| {
            Texture::presentable(
                device.clone(),
                image,
                view,
                swapchain.format(),
                swapchain.extent(),
            )
        })
        .collect()
}

impl FrameBackend for VulkanFrameBackend {
    type Fence = Fence;
    type Signal = Semaphore;
    type CommandUnit = CommandBuffer;

    fn create_fence(&mut self, signaled: bool) -> RhiResult<Fence> {
        Fence::new(self.device.clone(), signaled)
    }

    fn create_signal(&mut self) -> RhiResult<Semaphore> {
        Semaphore::new(self.device.clone())
    }

    fn create_command_unit(&mut self) -> RhiResult<CommandBuffer> {
        CommandBuffer::new(self.device.clone(), &self.command_pool)
    }

    fn wait_fence(&mut self, fence: &Fence, timeout: Duration) -> RhiResult<()> {
        fence.wait(timeout)
    }

    fn reset_fence(&mut self, fence: &Fence) -> RhiResult<()> {
        fence.reset()
    }

    fn begin_commands(&mut self, unit: &CommandBuffer) -> RhiResult<()> {
        unit.reset()?;
        unit.begin()
    }

    fn end_commands(&mut self, unit: &CommandBuffer) -> RhiResult<()> {
        unit.end()
    }

    fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    fn acquire_image(&mut self, signal: &Semaphore, timeout: Duration) -> RhiResult<AcquireOutcome> {
        self.swapchain.acquire_next_image(signal.handle(), timeout)
    }

    fn submit(
        &mut self,
        unit: &CommandBuffer,
        wait: &Semaphore,
        signal: &Semaphore,
        fence: &Fence,
    ) -> RhiResult<()> {
        // The first use of the acquired image is a transfer.
        let wait_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(wait.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)];
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(signal.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(unit.handle())];

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(&signal_infos);

        // SAFETY: all handles are alive for the duration of the call and the
        // pacer resets `fence` before every submission.
        unsafe { self.device.submit_graphics(&[submit_info], fence.handle()) }
    }

    fn present(&mut self, image_index: u32, wait: &Semaphore) -> RhiResult<PresentOutcome> {
        let outcome =
            self.swapchain
                .present(self.device.present_queue(), image_index, wait.handle())?;
        if outcome != PresentOutcome::Presented {
            debug!("Present reported {:?}", outcome);
        }
        Ok(outcome)
    }
}
