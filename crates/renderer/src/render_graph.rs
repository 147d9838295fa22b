//! Render graph placeholder.
//!
//! Pass scheduling is not implemented. [`RenderGraph`] exists so the frame
//! API already takes a graph; executing it records nothing.

use kiln_rhi::command::CommandBuffer;

/// Empty render graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderGraph;

impl RenderGraph {
    pub fn new() -> Self {
        Self
    }

    /// Record the graph's passes into `cmd`. Currently a no-op.
    pub fn execute(&self, _cmd: &CommandBuffer) {}
}
