//! Frame pacing.
//!
//! [`FramePacer`] keeps up to `N` frames in flight. Each frame counter `f`
//! maps to slot `f % N`, which owns a completion fence, a command unit and a
//! render target. Per-image signals are sized to the presentable-image count
//! `M` and live outside the slots.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on completion_fence[f % N]        (CPU waits for frame f - N)
//! 2. Acquire image, signaling image_acquired[f % M]
//!    -> out of date: return NeedsRebuild, nothing else touched
//! 3. Reset the fence, record commands into the slot's unit
//! 4. Submit: wait image_acquired[f % M],
//!            signal render_complete[image], fence completion_fence[f % N]
//! 5. Present, waiting on render_complete[image]
//! 6. f += 1
//! ```
//!
//! The pacer talks to the GPU only through [`FrameBackend`], so the ordering
//! above can be exercised against a simulated GPU.

use std::time::Duration;

use kiln_core::{Registry, RendererConfig, Rid};
use kiln_rhi::{AcquireOutcome, PresentOutcome, RhiError, RhiResult};
use tracing::{debug, info, trace};

/// GPU operations needed to pace frames.
pub trait FrameBackend {
    /// CPU-waitable completion primitive.
    type Fence;
    /// GPU-to-GPU ordering primitive.
    type Signal;
    /// Recordable unit of GPU work.
    type CommandUnit;

    fn create_fence(&mut self, signaled: bool) -> RhiResult<Self::Fence>;
    fn create_signal(&mut self) -> RhiResult<Self::Signal>;
    fn create_command_unit(&mut self) -> RhiResult<Self::CommandUnit>;

    /// Block until `fence` signals, failing with [`RhiError::FenceTimeout`]
    /// after `timeout`.
    fn wait_fence(&mut self, fence: &Self::Fence, timeout: Duration) -> RhiResult<()>;
    fn reset_fence(&mut self, fence: &Self::Fence) -> RhiResult<()>;

    fn begin_commands(&mut self, unit: &Self::CommandUnit) -> RhiResult<()>;
    fn end_commands(&mut self, unit: &Self::CommandUnit) -> RhiResult<()>;

    /// Number of presentable images.
    fn image_count(&self) -> u32;

    /// Acquire the next presentable image, signaling `signal` when ready.
    fn acquire_image(
        &mut self,
        signal: &Self::Signal,
        timeout: Duration,
    ) -> RhiResult<AcquireOutcome>;

    fn submit(
        &mut self,
        unit: &Self::CommandUnit,
        wait: &Self::Signal,
        signal: &Self::Signal,
        fence: &Self::Fence,
    ) -> RhiResult<()>;

    fn present(&mut self, image_index: u32, wait: &Self::Signal) -> RhiResult<PresentOutcome>;
}

/// Pacing parameters fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    pub frames_in_flight: usize,
    pub fence_timeout: Duration,
}

impl From<&RendererConfig> for PacingConfig {
    fn from(config: &RendererConfig) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight as usize,
            fence_timeout: config.fence_timeout(),
        }
    }
}

/// What the record callback gets for one frame.
pub struct FrameContext<'a, B: FrameBackend> {
    /// Monotonic frame counter.
    pub frame: u64,
    pub slot: usize,
    /// Presentable image acquired for this frame.
    pub image_index: u32,
    /// Render target owned by this slot.
    pub render_target: Rid,
    pub commands: &'a B::CommandUnit,
}

/// Outcome of [`FramePacer::render_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented {
        frame: u64,
        slot: usize,
        image_index: u32,
    },
    /// The presentable image set is stale and must be rebuilt, followed by
    /// [`FramePacer::rebuild_image_sync`].
    NeedsRebuild,
}

struct FrameSlot<B: FrameBackend> {
    fence: B::Fence,
    commands: B::CommandUnit,
    render_target: Rid,
}

/// Bounded frames-in-flight controller.
pub struct FramePacer<B: FrameBackend> {
    config: PacingConfig,
    slots: Vec<FrameSlot<B>>,
    image_acquired: Vec<B::Signal>,
    render_complete: Vec<B::Signal>,
    /// Render signals from the previous image set, kept alive for one more
    /// rebuild since presentation may still wait on them.
    retired_render_complete: Vec<B::Signal>,
    frame: u64,
}

impl<B: FrameBackend> FramePacer<B> {
    /// Create one slot per render target.
    ///
    /// # Errors
    ///
    /// [`RhiError::InvalidConfig`] if `frames_in_flight` is zero, exceeds the
    /// backend's image count, or differs from `render_targets.len()`.
    pub fn new(backend: &mut B, config: PacingConfig, render_targets: &[Rid]) -> RhiResult<Self> {
        check_frames_in_flight(config.frames_in_flight, backend.image_count())?;
        if render_targets.len() != config.frames_in_flight {
            return Err(RhiError::InvalidConfig(format!(
                "expected {} render targets, got {}",
                config.frames_in_flight,
                render_targets.len()
            )));
        }

        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for &render_target in render_targets {
            // Signaled so the first wait on each slot returns immediately.
            slots.push(FrameSlot {
                fence: backend.create_fence(true)?,
                commands: backend.create_command_unit()?,
                render_target,
            });
        }

        let (image_acquired, render_complete) = create_image_signals(backend)?;

        info!(
            "Frame pacer created: {} frames in flight, {} presentable images",
            config.frames_in_flight,
            image_acquired.len()
        );

        Ok(Self {
            config,
            slots,
            image_acquired,
            render_complete,
            retired_render_complete: Vec::new(),
            frame: 0,
        })
    }

    /// Run one frame.
    ///
    /// `record` is called between beginning and ending the slot's command
    /// unit. If acquisition reports the image set out of date, nothing is
    /// recorded, the slot's fence stays signaled and the frame counter does
    /// not advance.
    ///
    /// # Errors
    ///
    /// Fence timeouts, device loss and recording errors are returned as-is.
    /// An error after acquisition leaves the slot unusable; treat it as fatal.
    pub fn render_frame<F>(&mut self, backend: &mut B, record: F) -> RhiResult<FrameStatus>
    where
        F: FnOnce(&mut B, &FrameContext<'_, B>) -> RhiResult<()>,
    {
        let slot_index = (self.frame % self.slots.len() as u64) as usize;
        let slot = &self.slots[slot_index];

        backend.wait_fence(&slot.fence, self.config.fence_timeout)?;

        let acquire_index = (self.frame % self.image_acquired.len() as u64) as usize;
        let image_acquired = &self.image_acquired[acquire_index];

        let (image_index, acquire_suboptimal) =
            match backend.acquire_image(image_acquired, self.config.fence_timeout)? {
                AcquireOutcome::Ready {
                    image_index,
                    suboptimal,
                } => (image_index, suboptimal),
                AcquireOutcome::OutOfDate => {
                    debug!("Presentable images out of date at acquire (frame {})", self.frame);
                    return Ok(FrameStatus::NeedsRebuild);
                }
            };

        let render_complete = self.render_complete.get(image_index as usize).ok_or_else(|| {
            RhiError::InvalidConfig(format!(
                "acquired image {} but only {} images have signals",
                image_index,
                self.render_complete.len()
            ))
        })?;

        backend.reset_fence(&slot.fence)?;
        backend.begin_commands(&slot.commands)?;
        let context = FrameContext {
            frame: self.frame,
            slot: slot_index,
            image_index,
            render_target: slot.render_target,
            commands: &slot.commands,
        };
        record(backend, &context)?;
        backend.end_commands(&slot.commands)?;

        backend.submit(&slot.commands, image_acquired, render_complete, &slot.fence)?;
        let presented = backend.present(image_index, render_complete)?;

        trace!(
            "Frame {} done: slot {}, image {}",
            self.frame, slot_index, image_index
        );
        let frame = self.frame;
        self.frame += 1;

        if presented.needs_rebuild() || acquire_suboptimal {
            debug!("Presentable images stale after frame {} ({:?})", frame, presented);
            return Ok(FrameStatus::NeedsRebuild);
        }

        Ok(FrameStatus::Presented {
            frame,
            slot: slot_index,
            image_index,
        })
    }

    /// Recreate the per-image signals after the presentable image set changed.
    ///
    /// The GPU must be idle. Fences do not cover present waits, so the old
    /// render signals are retired rather than dropped and are only destroyed
    /// by the following rebuild. A present still pending across two rebuilds
    /// is not tracked.
    pub fn rebuild_image_sync(&mut self, backend: &mut B) -> RhiResult<()> {
        check_frames_in_flight(self.config.frames_in_flight, backend.image_count())?;
        let (image_acquired, render_complete) = create_image_signals(backend)?;
        self.image_acquired = image_acquired;
        self.retired_render_complete =
            std::mem::replace(&mut self.render_complete, render_complete);
        debug!(
            "Rebuilt image signals for {} presentable images",
            self.image_acquired.len()
        );
        Ok(())
    }

    /// Wait until every slot's last submission has completed.
    pub fn wait_idle(&self, backend: &mut B) -> RhiResult<()> {
        for slot in &self.slots {
            backend.wait_fence(&slot.fence, self.config.fence_timeout)?;
        }
        Ok(())
    }

    /// Replace the render target owned by `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    pub fn set_render_target(&mut self, slot: usize, render_target: Rid) {
        self.slots[slot].render_target = render_target;
    }

    /// Give every slot a fresh render target from `create`, releasing the old
    /// one from `registry`.
    ///
    /// A slot keeps its current target if `create` fails.
    pub fn replace_render_targets<T>(
        &mut self,
        registry: &mut Registry<T>,
        mut create: impl FnMut() -> RhiResult<T>,
    ) -> RhiResult<()> {
        for slot in &mut self.slots {
            let replacement = create()?;
            drop(registry.release(slot.render_target));
            slot.render_target = registry.allocate(replacement);
        }
        Ok(())
    }

    pub fn render_target(&self, slot: usize) -> Rid {
        self.slots[slot].render_target
    }

    pub fn render_targets(&self) -> impl Iterator<Item = Rid> + '_ {
        self.slots.iter().map(|slot| slot.render_target)
    }

    /// Number of frames submitted so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn config(&self) -> PacingConfig {
        self.config
    }
}

fn check_frames_in_flight(frames_in_flight: usize, image_count: u32) -> RhiResult<()> {
    if frames_in_flight == 0 {
        return Err(RhiError::InvalidConfig(
            "frames_in_flight must be at least 1".to_string(),
        ));
    }
    if frames_in_flight > image_count as usize {
        return Err(RhiError::InvalidConfig(format!(
            "frames_in_flight ({}) exceeds presentable image count ({})",
            frames_in_flight, image_count
        )));
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn create_image_signals<B: FrameBackend>(
    backend: &mut B,
) -> RhiResult<(Vec<B::Signal>, Vec<B::Signal>)> {
    let count = backend.image_count() as usize;
    let mut image_acquired = Vec::with_capacity(count);
    let mut render_complete = Vec::with_capacity(count);
    for _ in 0..count {
        image_acquired.push(backend.create_signal()?);
        render_complete.push(backend.create_signal()?);
    }
    Ok((image_acquired, render_complete))
}
