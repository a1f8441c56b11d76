//! Sandbox limits applied to every execution context

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Engine-wide cap on linear memory pages, whatever the module declares
    pub max_memory_pages: u32,
    /// Maximum number of nested wasm frames
    pub max_call_depth: u32,
    /// Native stack generated code may use below the entry frame.
    ///
    /// Clamped at call time so a host reserve stays free above the bottom of
    /// the calling thread's stack.
    pub max_native_stack: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 528,
            max_call_depth: 250,
            max_native_stack: 1024 * 1024,
        }
    }
}
