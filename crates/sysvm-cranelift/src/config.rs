//! Code generation settings

use serde::{Deserialize, Serialize};

/// Bumped whenever generated code or the VM context layout changes
pub const CODEGEN_VERSION: u32 = 2;

/// Static meter charges injected into generated code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CostSchedule {
    /// Base charge on every function entry
    pub function_entry: u64,
    /// Base charge on every loop iteration, including the first
    pub loop_iteration: u64,
    /// Charge per instruction in the metered body
    pub per_instruction: u64,
    /// Charge per page requested by `memory.grow`
    pub memory_grow_page: u64,
}

impl Default for CostSchedule {
    fn default() -> Self {
        Self {
            function_entry: 10,
            loop_iteration: 10,
            per_instruction: 1,
            memory_grow_page: 1_000,
        }
    }
}

/// Hard limits enforced while compiling a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenLimits {
    /// Parameters plus declared locals per function
    pub max_function_locals: u32,
    /// Size of the function index space
    pub max_functions: u32,
    pub max_table_elements: u32,
}

impl Default for CodegenLimits {
    fn default() -> Self {
        Self {
            max_function_locals: 50_000,
            max_functions: 100_000,
            max_table_elements: 1_048_576,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    pub cost: CostSchedule,
    #[serde(flatten)]
    pub limits: CodegenLimits,
}

impl CodegenConfig {
    /// Stable description of everything that influences generated code.
    ///
    /// Two configurations with equal fingerprints compile any module to the
    /// same artifact.
    pub fn fingerprint(&self, max_memory_pages: u32) -> String {
        let CostSchedule {
            function_entry,
            loop_iteration,
            per_instruction,
            memory_grow_page,
        } = self.cost;
        let CodegenLimits {
            max_function_locals,
            max_functions,
            max_table_elements,
        } = self.limits;
        format!(
            "sysvm-codegen/{CODEGEN_VERSION}/{}/{}/cost:{function_entry},{loop_iteration},{per_instruction},{memory_grow_page}/limits:{max_function_locals},{max_functions},{max_table_elements},{max_memory_pages}",
            env!("CARGO_PKG_VERSION"),
            target_lexicon::Triple::host(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_cost_schedule() {
        let base = CodegenConfig::default();
        let mut cheaper = base;
        cheaper.cost.loop_iteration = 1;
        assert_ne!(base.fingerprint(528), cheaper.fingerprint(528));
        assert_ne!(base.fingerprint(528), base.fingerprint(16));
        assert_eq!(base.fingerprint(528), CodegenConfig::default().fingerprint(528));
    }
}
