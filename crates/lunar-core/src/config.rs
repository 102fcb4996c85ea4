//! Tunable limits for the compiler and the virtual machine.
//!
//! ```
//! use lunar_core::VmConfig;
//!
//! let config = VmConfig {
//!     max_native_depth: 100,
//!     ..VmConfig::default()
//! };
//! assert_eq!(config.max_meta_chain, 100);
//! ```

/// Largest number of active locals in one function.
pub const MAX_LOCALS: usize = 200;
/// Largest register index a function may use. Stays below [`crate::MULTI`].
pub const MAX_REGISTERS: usize = 250;
/// Largest number of upvalues one closure may capture.
pub const MAX_UPVALUES: usize = 255;
/// Largest constant pool (and name table) per function.
pub const MAX_CONSTANTS: usize = u16::MAX as usize + 1;
/// Deepest nesting of blocks, expressions and suffix chains in one chunk.
/// Every later stage walks the tree recursively, so this also bounds them.
pub const MAX_SYNTAX_DEPTH: usize = 200;

/// Runtime limits and garbage-collector pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct VmConfig {
    /// Stack slots one thread may use before `stack overflow`.
    pub max_stack: usize,
    /// Nested Rust re-entries (metamethods, natives calling back) before `stack overflow`.
    pub max_native_depth: usize,
    /// Maximum `__index` / `__newindex` hops for one access.
    pub max_meta_chain: usize,
    /// Allocations before the first collection.
    pub gc_initial_threshold: usize,
    /// After a cycle the next threshold is `live * gc_step_multiplier`.
    pub gc_step_multiplier: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack: 1_000_000,
            max_native_depth: 200,
            max_meta_chain: 100,
            gc_initial_threshold: 1024,
            gc_step_multiplier: 2,
        }
    }
}

/// Compiler switches.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    /// Fold `-<numeral>` and arithmetic on numeric literals at compile time.
    pub fold_constants: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            fold_constants: true,
        }
    }
}
