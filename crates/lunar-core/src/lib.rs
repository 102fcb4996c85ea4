//! `lunar-core` — types shared by every stage of the lunar runtime.
//!
//! This crate defines:
//! - [`OpCode`]: the register-machine instruction set
//! - [`Proto`] / [`Constant`] / [`UpvalueDesc`]: the immutable output of compilation
//! - [`LuaError`]: static (lex / syntax / compile) errors with source positions
//! - [`VmConfig`] / [`CompilerConfig`]: tunable limits

pub mod config;
pub mod error;
pub mod opcode;
pub mod proto;

pub use config::{CompilerConfig, VmConfig};
pub use error::LuaError;
pub use opcode::{ArithOp, OpCode, MULTI};
pub use proto::{Constant, Proto, UpvalueDesc};
