use lua_core::Proto;
use std::sync::Arc;

/// A compiled main chunk: thin wrapper around the root [`Proto`].
///
/// This is the artifact produced by [`Compiler::compile`](crate::Compiler::compile)
/// and consumed by the VM.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The root function prototype.
    pub proto: Arc<Proto>,
}

impl Chunk {
    pub fn new(proto: Proto) -> Self {
        Self {
            proto: Arc::new(proto),
        }
    }
}
