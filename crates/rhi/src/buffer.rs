//! GPU buffer resources.
//!
//! [`Buffer`] owns a VkBuffer and its gpu-allocator allocation. It follows the
//! same lifetime contract as [`Texture`](crate::texture::Texture): an explicit
//! [`Release::release`] tears it down exactly once, and dropping an unreleased
//! buffer releases it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_rhi::device::Device;
//! use kiln_rhi::buffer::{Buffer, BufferUsage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), kiln_rhi::RhiError> {
//! let weights: [f32; 4] = [0.1, 0.2, 0.3, 0.4];
//! let staging = Buffer::new_with_data(device, BufferUsage::Staging, bytemuck::cast_slice(&weights))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use kiln_core::Release;
use tracing::debug;

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// How a buffer is used, which fixes its usage flags and memory location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// CPU-written source for uploads.
    Staging,
    /// CPU-written constants read by shaders.
    Uniform,
    /// GPU-only storage, readable and writable by shaders and transfers.
    Storage,
    /// GPU-written, CPU-read destination for downloads.
    Readback,
}

impl BufferUsage {
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Readback => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Staging | BufferUsage::Uniform => MemoryLocation::CpuToGpu,
            BufferUsage::Storage => MemoryLocation::GpuOnly,
            BufferUsage::Readback => MemoryLocation::GpuToCpu,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Staging => "staging",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Readback => "readback",
        }
    }
}

/// GPU buffer with gpu-allocator managed memory.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    released: bool,
}

impl Buffer {
    /// Create a buffer of `size` bytes.
    pub fn new(device: Arc<Device>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidConfig(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.lock_allocator().allocate(&AllocationCreateDesc {
            name: usage.name(),
            requirements,
            location: usage.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };

        let created = Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            released: false,
        };
        // On failure `created` drops here and releases what was made so far.
        bound?;

        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(created)
    }

    /// Create a host-visible buffer holding `data`.
    pub fn new_with_data(device: Arc<Device>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(device, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Copy `data` into mapped memory at `offset`.
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        check_write_range(offset, data.len() as vk::DeviceSize, self.size)?;

        let mapped_ptr = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| {
                RhiError::InvalidConfig(format!("{} buffer is not host-visible", self.usage.name()))
            })?;

        unsafe {
            let dst = mapped_ptr.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(())
    }

    /// Copy a slice of plain-old-data values into mapped memory at `offset`.
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, values: &[T]) -> RhiResult<()> {
        self.write_data(offset, bytemuck::cast_slice(values))
    }

    /// Record a copy of this buffer's full contents into `dst`.
    ///
    /// Only records the command; the caller submits and synchronizes.
    pub fn copy_to(&self, cmd: &CommandBuffer, dst: &Buffer) -> RhiResult<()> {
        check_copy(self.usage, self.size, dst.usage, dst.size)?;
        let region = vk::BufferCopy::default().size(self.size);
        cmd.copy_buffer(self.buffer, dst.buffer, &[region]);
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

/// Reject writes whose end overflows or lies past `size`.
fn check_write_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    size: vk::DeviceSize,
) -> RhiResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RhiError::InvalidConfig(format!(
            "Write exceeds buffer size: offset {} + data {} > buffer {}",
            offset, len, size
        ))),
    }
}

fn check_copy(
    src: BufferUsage,
    src_size: vk::DeviceSize,
    dst: BufferUsage,
    dst_size: vk::DeviceSize,
) -> RhiResult<()> {
    if !src.to_vk_usage().contains(vk::BufferUsageFlags::TRANSFER_SRC) {
        return Err(RhiError::InvalidConfig(format!(
            "{} buffer cannot be a copy source",
            src.name()
        )));
    }
    if !dst.to_vk_usage().contains(vk::BufferUsageFlags::TRANSFER_DST) {
        return Err(RhiError::InvalidConfig(format!(
            "{} buffer cannot be a copy destination",
            dst.name()
        )));
    }
    if dst_size < src_size {
        return Err(RhiError::InvalidConfig(format!(
            "copy of {} bytes does not fit in {} bytes",
            src_size, dst_size
        )));
    }
    Ok(())
}

impl Release for Buffer {
    /// Free the allocation and destroy the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was already released.
    fn release(&mut self) {
        assert!(!self.released, "Buffer::release: double release");
        self.released = true;

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.lock_allocator().free(allocation)
        {
            tracing::error!("Failed to free buffer allocation: {:?}", e);
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
        self.buffer = vk::Buffer::null();

        debug!("Destroyed {} buffer", self.usage.name());
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Staging
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_SRC)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::Storage
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Readback
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_DST)
        );
    }

    #[test]
    fn test_write_range_within_buffer() {
        assert!(check_write_range(0, 64, 64).is_ok());
        assert!(check_write_range(60, 4, 64).is_ok());
        assert!(check_write_range(64, 0, 64).is_ok());
    }

    #[test]
    fn test_write_range_past_end() {
        assert!(matches!(
            check_write_range(61, 4, 64),
            Err(RhiError::InvalidConfig(_))
        ));
        assert!(matches!(
            check_write_range(0, 65, 64),
            Err(RhiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_write_range_offset_overflow() {
        // Wrapping would put the end at 2, inside the buffer.
        assert!(matches!(
            check_write_range(u64::MAX - 1, 4, 64),
            Err(RhiError::InvalidConfig(_))
        ));
        assert!(check_write_range(u64::MAX, 1, u64::MAX).is_err());
    }

    #[test]
    fn test_buffer_usage_memory_location() {
        assert_eq!(BufferUsage::Staging.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Uniform.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Storage.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferUsage::Readback.memory_location(), MemoryLocation::GpuToCpu);
    }

    #[test]
    fn test_copy_checks() {
        assert!(check_copy(BufferUsage::Staging, 64, BufferUsage::Storage, 64).is_ok());
        assert!(check_copy(BufferUsage::Storage, 64, BufferUsage::Readback, 128).is_ok());
        assert!(matches!(
            check_copy(BufferUsage::Uniform, 64, BufferUsage::Storage, 64),
            Err(RhiError::InvalidConfig(_))
        ));
        assert!(matches!(
            check_copy(BufferUsage::Staging, 64, BufferUsage::Staging, 64),
            Err(RhiError::InvalidConfig(_))
        ));
        assert!(matches!(
            check_copy(BufferUsage::Staging, 128, BufferUsage::Storage, 64),
            Err(RhiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Buffer>();
    }
}
