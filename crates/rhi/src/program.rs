//! Externally built pipelines bound during frame recording.
//!
//! The engine does not compile shaders or build pipelines. A [`BoundProgram`]
//! carries a pipeline created elsewhere together with the bind point and the
//! workgroup size needed to cover an image. The pipeline is not owned: the
//! creator destroys it after the last frame that used it has completed.

use ash::vk;

use crate::command::CommandBuffer;

/// Opaque pipeline handle plus what is needed to dispatch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundProgram {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
    /// Local workgroup size declared by the compute shader.
    pub workgroup_size: [u32; 3],
}

impl BoundProgram {
    /// Compute program with an 8x8 local size, matching a per-pixel kernel.
    pub fn compute(pipeline: vk::Pipeline) -> Self {
        Self {
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            workgroup_size: [8, 8, 1],
        }
    }

    pub fn with_workgroup_size(mut self, x: u32, y: u32, z: u32) -> Self {
        self.workgroup_size = [x, y, z];
        self
    }

    /// Number of workgroups needed to cover `extent`.
    pub fn group_counts(&self, extent: vk::Extent2D) -> [u32; 3] {
        let [x, y, _] = self.workgroup_size;
        [
            extent.width.div_ceil(x.max(1)),
            extent.height.div_ceil(y.max(1)),
            1,
        ]
    }

    /// Bind the pipeline and, for compute programs, dispatch over `extent`.
    pub fn record(&self, cmd: &CommandBuffer, extent: vk::Extent2D) {
        cmd.bind_pipeline(self.bind_point, self.pipeline);
        if self.bind_point == vk::PipelineBindPoint::COMPUTE {
            let [x, y, z] = self.group_counts(extent);
            cmd.dispatch(x, y, z);
        }
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        self.bind_point == vk::PipelineBindPoint::COMPUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_counts_round_up() {
        let program = BoundProgram::compute(vk::Pipeline::null());
        let counts = program.group_counts(vk::Extent2D {
            width: 1600,
            height: 801,
        });
        assert_eq!(counts, [200, 101, 1]);
    }

    #[test]
    fn test_custom_workgroup_size() {
        let program = BoundProgram::compute(vk::Pipeline::null()).with_workgroup_size(16, 16, 1);
        assert_eq!(program.workgroup_size, [16, 16, 1]);
        assert_eq!(
            program.group_counts(vk::Extent2D {
                width: 17,
                height: 16,
            }),
            [2, 1, 1]
        );
        assert!(program.is_compute());
    }

    #[test]
    fn test_zero_workgroup_size_does_not_divide_by_zero() {
        let program = BoundProgram::compute(vk::Pipeline::null()).with_workgroup_size(0, 0, 0);
        assert_eq!(
            program.group_counts(vk::Extent2D {
                width: 4,
                height: 3,
            }),
            [4, 3, 1]
        );
    }
}
