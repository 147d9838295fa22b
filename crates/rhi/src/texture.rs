//! GPU texture resources and image-state tracking.
//!
//! A [`Texture`] owns one VkImage, its gpu-allocator allocation and a view,
//! plus the metadata the renderer needs: format, extent and the current
//! [`ImageState`]. Swapchain images are wrapped with
//! [`Texture::presentable`] so they go through the same state tracking, but
//! their memory and views stay with the swapchain.
//!
//! Operations ([`TextureOps`]) only append commands to a caller-supplied
//! [`CommandBuffer`]. Nothing here submits work or waits on the GPU.
//!
//! # Lifetime
//!
//! [`Release::release`] tears the texture down exactly once; a second call
//! panics. Dropping an unreleased texture releases it, so textures held in a
//! [`Registry`](kiln_core::Registry) are cleaned up either by
//! `Registry::clear` at shutdown or by dropping the value returned from
//! `Registry::release`.

use std::sync::Arc;

use ash::vk;
use glam::Vec4;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use kiln_core::Release;
use tracing::debug;

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Usage state of an image, tracked per texture.
///
/// Each state fixes the image layout and the stage/access masks used on
/// either side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageState {
    Undefined,
    TransferSrc,
    TransferDst,
    General,
    ColorAttachment,
    ShaderRead,
    PresentSource,
}

impl ImageState {
    /// Image layout for this state.
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageState::Undefined => vk::ImageLayout::UNDEFINED,
            ImageState::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageState::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageState::General => vk::ImageLayout::GENERAL,
            ImageState::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageState::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageState::PresentSource => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Pipeline stages that touch the image in this state.
    pub fn stage(self) -> vk::PipelineStageFlags2 {
        match self {
            ImageState::Undefined => vk::PipelineStageFlags2::TOP_OF_PIPE,
            ImageState::TransferSrc | ImageState::TransferDst => vk::PipelineStageFlags2::ALL_TRANSFER,
            ImageState::General => vk::PipelineStageFlags2::ALL_COMMANDS,
            ImageState::ColorAttachment => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ImageState::ShaderRead => {
                vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER
            }
            ImageState::PresentSource => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        }
    }

    /// Memory accesses performed on the image in this state.
    pub fn access(self) -> vk::AccessFlags2 {
        match self {
            ImageState::Undefined | ImageState::PresentSource => vk::AccessFlags2::NONE,
            ImageState::TransferSrc => vk::AccessFlags2::TRANSFER_READ,
            ImageState::TransferDst => vk::AccessFlags2::TRANSFER_WRITE,
            ImageState::General => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            ImageState::ColorAttachment => {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            }
            ImageState::ShaderRead => vk::AccessFlags2::SHADER_SAMPLED_READ,
        }
    }
}

/// Caller-supplied description of a state transition.
///
/// Masks left unset default to the masks of the source and destination
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateTransition {
    pub to: ImageState,
    pub src_stage: Option<vk::PipelineStageFlags2>,
    pub dst_stage: Option<vk::PipelineStageFlags2>,
    pub src_access: Option<vk::AccessFlags2>,
    pub dst_access: Option<vk::AccessFlags2>,
}

impl StateTransition {
    /// Transition to `state` with default masks.
    pub fn to(state: ImageState) -> Self {
        Self {
            to: state,
            src_stage: None,
            dst_stage: None,
            src_access: None,
            dst_access: None,
        }
    }

    pub fn src_stage(mut self, stage: vk::PipelineStageFlags2) -> Self {
        self.src_stage = Some(stage);
        self
    }

    pub fn dst_stage(mut self, stage: vk::PipelineStageFlags2) -> Self {
        self.dst_stage = Some(stage);
        self
    }

    pub fn src_access(mut self, access: vk::AccessFlags2) -> Self {
        self.src_access = Some(access);
        self
    }

    pub fn dst_access(mut self, access: vk::AccessFlags2) -> Self {
        self.dst_access = Some(access);
        self
    }
}

/// Check a transition from `from`.
///
/// Returns `Ok(false)` when the image is already in the target state and no
/// barrier is needed.
pub fn check_transition(from: ImageState, to: ImageState) -> RhiResult<bool> {
    if from == to {
        return Ok(false);
    }
    if to == ImageState::Undefined {
        return Err(RhiError::IllegalTransition { from, to });
    }
    Ok(true)
}

/// Check that an image in `state` may be cleared.
pub fn check_clear(state: ImageState) -> RhiResult<()> {
    match state {
        ImageState::TransferDst | ImageState::General => Ok(()),
        actual => Err(RhiError::InvalidImageState {
            op: "clear",
            expected: "TransferDst or General",
            actual,
        }),
    }
}

/// Check that a blit from an image in `src` to one in `dst` is allowed.
pub fn check_blit(src: ImageState, dst: ImageState) -> RhiResult<()> {
    if !matches!(src, ImageState::TransferSrc | ImageState::General) {
        return Err(RhiError::InvalidImageState {
            op: "blit source",
            expected: "TransferSrc or General",
            actual: src,
        });
    }
    if !matches!(dst, ImageState::TransferDst | ImageState::General) {
        return Err(RhiError::InvalidImageState {
            op: "blit destination",
            expected: "TransferDst or General",
            actual: dst,
        });
    }
    Ok(())
}

/// Build the synchronization2 barrier for `transition` out of `from`.
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    from: ImageState,
    transition: &StateTransition,
) -> vk::ImageMemoryBarrier2<'static> {
    let to = transition.to;
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(transition.src_stage.unwrap_or_else(|| from.stage()))
        .src_access_mask(transition.src_access.unwrap_or_else(|| from.access()))
        .dst_stage_mask(transition.dst_stage.unwrap_or_else(|| to.stage()))
        .dst_access_mask(transition.dst_access.unwrap_or_else(|| to.access()))
        .old_layout(from.layout())
        .new_layout(to.layout())
        .image(image)
        .subresource_range(full_range(aspect))
}

fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

fn full_blit_region(
    aspect: vk::ImageAspectFlags,
    src: vk::Extent2D,
    dst: vk::Extent2D,
) -> vk::ImageBlit2<'static> {
    let layers = vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);
    let corner = |extent: vk::Extent2D| vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    };
    vk::ImageBlit2::default()
        .src_subresource(layers)
        .src_offsets([vk::Offset3D::default(), corner(src)])
        .dst_subresource(layers)
        .dst_offsets([vk::Offset3D::default(), corner(dst)])
}

/// Parameters for [`Texture::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl TextureDesc {
    /// Format used for offscreen render targets.
    pub const RENDER_TARGET_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

    /// Offscreen color target that can be cleared, written by compute and
    /// blitted to the swapchain.
    pub fn render_target(extent: vk::Extent2D) -> Self {
        Self {
            name: "render_target",
            extent,
            format: Self::RENDER_TARGET_FORMAT,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }
}

enum Backing {
    /// Image, view and memory belong to this texture.
    Owned(Option<Allocation>),
    /// Swapchain image; the swapchain destroys it.
    Presentable,
}

/// One GPU image plus its view and tracked state.
pub struct Texture {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    backing: Backing,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    state: ImageState,
    released: bool,
}

impl Texture {
    /// Create a 2D texture with device-local memory and a full view.
    pub fn new(device: Arc<Device>, desc: &TextureDesc) -> RhiResult<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::InvalidConfig(format!(
                "Texture '{}' extent must be non-zero, got {}x{}",
                desc.name, desc.extent.width, desc.extent.height
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };

        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.lock_allocator().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };
        // SAFETY: the memory stays owned by `allocation`, which outlives the image.
        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();

        // From here on, dropping `texture` on an error path releases it.
        let mut texture = Self {
            device,
            image,
            view: vk::ImageView::null(),
            backing: Backing::Owned(Some(allocation)),
            format: desc.format,
            extent: desc.extent,
            aspect: desc.aspect,
            state: ImageState::Undefined,
            released: false,
        };

        unsafe {
            texture
                .device
                .handle()
                .bind_image_memory(image, memory, offset)?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(full_range(desc.aspect));

        texture.view = unsafe { texture.device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created texture '{}': {}x{} ({:?})",
            desc.name, desc.extent.width, desc.extent.height, desc.format
        );

        Ok(texture)
    }

    /// Wrap a swapchain image for state tracking.
    ///
    /// The image and view remain owned by the swapchain; releasing the
    /// wrapper destroys nothing.
    pub fn presentable(
        device: Arc<Device>,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            device,
            image,
            view,
            backing: Backing::Presentable,
            format,
            extent,
            aspect: vk::ImageAspectFlags::COLOR,
            state: ImageState::Undefined,
            released: false,
        }
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Current tracked state.
    #[inline]
    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Whether the memory belongs to a swapchain.
    #[inline]
    pub fn is_presentable(&self) -> bool {
        matches!(self.backing, Backing::Presentable)
    }

    /// Forget the tracked state, e.g. once the contents may be discarded.
    ///
    /// The next transition then starts from [`ImageState::Undefined`].
    pub fn discard_contents(&mut self) {
        self.state = ImageState::Undefined;
    }
}

/// Recording operations on textures.
///
/// Implemented per backend; every method appends to `cmd` and never submits.
pub trait TextureOps {
    /// Command recording context for this backend.
    type Commands;

    /// Record a state transition and update the tracked state.
    ///
    /// A transition to the current state records nothing. Transitions to
    /// [`ImageState::Undefined`] fail with [`RhiError::IllegalTransition`].
    fn transition(&mut self, cmd: &Self::Commands, transition: StateTransition) -> RhiResult<()>;

    /// Clear the whole image to `color`. Requires TransferDst or General.
    fn clear(&self, cmd: &Self::Commands, color: Vec4) -> RhiResult<()>;

    /// Scaled copy of the whole image into `dst`.
    fn blit_to(&self, cmd: &Self::Commands, dst: &Self) -> RhiResult<()>;
}

impl TextureOps for Texture {
    type Commands = CommandBuffer;

    fn transition(&mut self, cmd: &CommandBuffer, transition: StateTransition) -> RhiResult<()> {
        if !check_transition(self.state, transition.to)? {
            return Ok(());
        }
        let barrier = image_barrier(self.image, self.aspect, self.state, &transition);
        cmd.image_barriers(&[barrier]);
        self.state = transition.to;
        Ok(())
    }

    fn clear(&self, cmd: &CommandBuffer, color: Vec4) -> RhiResult<()> {
        check_clear(self.state)?;
        let value = vk::ClearColorValue {
            float32: color.to_array(),
        };
        cmd.clear_color_image(self.image, self.state.layout(), &value, &[full_range(self.aspect)]);
        Ok(())
    }

    fn blit_to(&self, cmd: &CommandBuffer, dst: &Texture) -> RhiResult<()> {
        check_blit(self.state, dst.state)?;
        let regions = [full_blit_region(self.aspect, self.extent, dst.extent)];
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(self.image)
            .src_image_layout(self.state.layout())
            .dst_image(dst.image)
            .dst_image_layout(dst.state.layout())
            .regions(&regions)
            .filter(vk::Filter::LINEAR);
        cmd.blit_image(&blit_info);
        Ok(())
    }
}

impl Release for Texture {
    /// Destroy the view, then the image, then free the memory.
    ///
    /// # Panics
    ///
    /// Panics if the texture was already released.
    fn release(&mut self) {
        assert!(!self.released, "Texture::release: double release");
        self.released = true;

        if let Backing::Owned(allocation) = &mut self.backing {
            unsafe {
                self.device.handle().destroy_image_view(self.view, None);
                self.device.handle().destroy_image(self.image, None);
            }
            if let Some(allocation) = allocation.take()
                && let Err(e) = self.device.lock_allocator().free(allocation)
            {
                tracing::error!("Failed to free texture allocation: {:?}", e);
            }
            debug!(
                "Destroyed texture: {}x{}",
                self.extent.width, self.extent.height
            );
        }

        self.image = vk::Image::null();
        self.view = vk::ImageView::null();
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ImageState; 7] = [
        ImageState::Undefined,
        ImageState::TransferSrc,
        ImageState::TransferDst,
        ImageState::General,
        ImageState::ColorAttachment,
        ImageState::ShaderRead,
        ImageState::PresentSource,
    ];

    #[test]
    fn test_state_layouts() {
        assert_eq!(ImageState::Undefined.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            ImageState::TransferDst.layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            ImageState::PresentSource.layout(),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(ImageState::General.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_transfer_states_use_transfer_masks() {
        assert_eq!(
            ImageState::TransferSrc.access(),
            vk::AccessFlags2::TRANSFER_READ
        );
        assert_eq!(
            ImageState::TransferDst.access(),
            vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(
            ImageState::TransferDst.stage(),
            vk::PipelineStageFlags2::ALL_TRANSFER
        );
    }

    #[test]
    fn test_transition_to_undefined_is_illegal() {
        for from in ALL_STATES.into_iter().filter(|s| *s != ImageState::Undefined) {
            let err = check_transition(from, ImageState::Undefined).unwrap_err();
            assert!(matches!(
                err,
                RhiError::IllegalTransition {
                    to: ImageState::Undefined,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_transition_to_same_state_is_noop() {
        for state in ALL_STATES {
            assert!(!check_transition(state, state).unwrap());
        }
    }

    #[test]
    fn test_other_transitions_are_recorded() {
        assert!(check_transition(ImageState::Undefined, ImageState::TransferDst).unwrap());
        assert!(check_transition(ImageState::TransferDst, ImageState::TransferSrc).unwrap());
        assert!(check_transition(ImageState::TransferDst, ImageState::PresentSource).unwrap());
        assert!(check_transition(ImageState::PresentSource, ImageState::TransferDst).unwrap());
    }

    #[test]
    fn test_clear_requires_writable_state() {
        assert!(check_clear(ImageState::TransferDst).is_ok());
        assert!(check_clear(ImageState::General).is_ok());
        for state in [
            ImageState::Undefined,
            ImageState::TransferSrc,
            ImageState::PresentSource,
            ImageState::ShaderRead,
        ] {
            assert!(matches!(
                check_clear(state),
                Err(RhiError::InvalidImageState { op: "clear", .. })
            ));
        }
    }

    #[test]
    fn test_blit_requires_transfer_states() {
        assert!(check_blit(ImageState::TransferSrc, ImageState::TransferDst).is_ok());
        assert!(check_blit(ImageState::General, ImageState::General).is_ok());
        assert!(matches!(
            check_blit(ImageState::TransferDst, ImageState::TransferDst),
            Err(RhiError::InvalidImageState {
                op: "blit source",
                ..
            })
        ));
        assert!(matches!(
            check_blit(ImageState::TransferSrc, ImageState::PresentSource),
            Err(RhiError::InvalidImageState {
                op: "blit destination",
                ..
            })
        ));
    }

    #[test]
    fn test_barrier_uses_state_masks_by_default() {
        let barrier = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ImageState::TransferDst,
            &StateTransition::to(ImageState::TransferSrc),
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_barrier_honors_supplied_masks() {
        let transition = StateTransition::to(ImageState::General)
            .src_stage(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .src_access(vk::AccessFlags2::SHADER_STORAGE_WRITE)
            .dst_stage(vk::PipelineStageFlags2::BLIT)
            .dst_access(vk::AccessFlags2::TRANSFER_READ);
        let barrier = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ImageState::General,
            &transition,
        );
        assert_eq!(
            barrier.src_stage_mask,
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
        assert_eq!(
            barrier.src_access_mask,
            vk::AccessFlags2::SHADER_STORAGE_WRITE
        );
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::BLIT);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
    }

    #[test]
    fn test_blit_region_covers_both_extents() {
        let region = full_blit_region(
            vk::ImageAspectFlags::COLOR,
            vk::Extent2D {
                width: 1600,
                height: 800,
            },
            vk::Extent2D {
                width: 800,
                height: 400,
            },
        );
        assert_eq!(region.src_offsets[1].x, 1600);
        assert_eq!(region.src_offsets[1].y, 800);
        assert_eq!(region.dst_offsets[1].x, 800);
        assert_eq!(region.dst_offsets[1].z, 1);
    }

    #[test]
    fn test_render_target_desc() {
        let desc = TextureDesc::render_target(vk::Extent2D {
            width: 64,
            height: 32,
        });
        assert!(desc.usage.contains(
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
        ));
        assert_eq!(desc.format, TextureDesc::RENDER_TARGET_FORMAT);
        assert_eq!(desc.aspect, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_texture_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Texture>();
    }
}
