//! Synchronization primitives for Vulkan.
//!
//! - [`Semaphore`] - GPU-to-GPU ordering between queue operations
//! - [`Fence`] - GPU-to-CPU completion signal the host can wait on
//!
//! Frame-level pacing built on top of these lives in `kiln_renderer`.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Vulkan semaphore wrapper.
///
/// Used to order image acquisition, rendering and presentation on the GPU.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };

        debug!("Created semaphore");

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed semaphore");
    }
}

/// Vulkan fence wrapper.
///
/// Frame fences are created signaled so the first wait on each frame slot
/// returns immediately.
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence, optionally already signaled.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);

        let fence = unsafe { device.handle().create_fence(&create_info, None)? };

        debug!(
            "Created fence ({})",
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`RhiError::FenceTimeout`] if the fence is still unsignaled after `timeout`
    /// - [`RhiError::DeviceLost`] if the device was lost while waiting
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        let fences = [self.fence];
        let result = unsafe {
            self.device
                .handle()
                .wait_for_fences(&fences, true, timeout_nanos(timeout))
        };
        result.map_err(|e| wait_error(e, timeout))
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be in use by any pending queue submission.
    pub fn reset(&self) -> RhiResult<()> {
        let fences = [self.fence];
        unsafe { self.device.handle().reset_fences(&fences) }
            .map_err(|e| RhiError::from_vk("fence reset", e))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
        debug!("Destroyed fence");
    }
}

/// Convert a timeout to the nanosecond count Vulkan expects, saturating.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn wait_error(result: vk::Result, timeout: Duration) -> RhiError {
    match result {
        vk::Result::TIMEOUT => RhiError::FenceTimeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        other => RhiError::from_vk("fence wait", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_timeout_nanos_saturates() {
        assert_eq!(timeout_nanos(Duration::from_millis(5)), 5_000_000);
        assert_eq!(timeout_nanos(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_wait_timeout_maps_to_fence_timeout() {
        let err = wait_error(vk::Result::TIMEOUT, Duration::from_secs(5));
        assert!(matches!(err, RhiError::FenceTimeout { timeout_ms: 5000 }));
    }

    #[test]
    fn test_wait_device_lost_maps_to_device_lost() {
        let err = wait_error(vk::Result::ERROR_DEVICE_LOST, Duration::from_secs(1));
        assert!(matches!(err, RhiError::DeviceLost("fence wait")));
    }
}
