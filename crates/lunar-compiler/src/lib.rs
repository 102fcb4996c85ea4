//! `lunar-compiler` — lowers a parsed chunk to register bytecode.
//!
//! Scoping rules that the grammar cannot express are checked here:
//! `break` placement, `goto` visibility, `<const>` assignment and local and
//! upvalue limits.

pub mod builder;
pub mod compiler;
pub mod disasm;
pub mod scope;

pub use builder::ProtoBuilder;
pub use compiler::Compiler;
pub use disasm::disassemble;

use lunar_core::{CompilerConfig, LuaError, Proto};
use std::rc::Rc;

/// Parse and compile `src` with the default configuration.
pub fn compile_source(src: &str, chunk_name: &str) -> Result<Rc<Proto>, LuaError> {
    compile_with(src, chunk_name, CompilerConfig::default())
}

pub fn compile_with(
    src: &str,
    chunk_name: &str,
    config: CompilerConfig,
) -> Result<Rc<Proto>, LuaError> {
    let block = lunar_parser::parse(src)?;
    Compiler::new(chunk_name)
        .with_config(config)
        .compile(&block)
}
