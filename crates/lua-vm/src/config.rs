/// Runtime limits for a [`crate::LuaState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Extra slots reserved above a frame's registers; also the initial
    /// capacity of a native function's frame.
    pub min_stack: usize,
    /// Maximum number of live call frames before `StackOverflow`.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            min_stack: 20,
            max_call_depth: 200,
        }
    }
}

impl VmConfig {
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}
