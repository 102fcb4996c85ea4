use lunar_core::config::MAX_CONSTANTS;
use lunar_core::{Constant, LuaError, OpCode, Proto, UpvalueDesc};
use std::rc::Rc;

/// Mutable builder for a [`Proto`] during compilation.
#[derive(Debug)]
pub struct ProtoBuilder {
    pub instructions: Vec<OpCode>,
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    pub names: Vec<Rc<str>>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    pub upvalue_names: Vec<Rc<str>>,
    pub param_count: u8,
    pub is_vararg: bool,
    pub source: Rc<str>,
    pub line_defined: u32,
}

impl ProtoBuilder {
    pub fn new(source: Rc<str>, line_defined: u32) -> Self {
        Self {
            instructions: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            protos: Vec::new(),
            upvalue_descs: Vec::new(),
            upvalue_names: Vec::new(),
            param_count: 0,
            is_vararg: false,
            source,
            line_defined,
        }
    }

    /// Append `op`, returning its index.
    pub fn emit(&mut self, op: OpCode, line: u32) -> usize {
        self.instructions.push(op);
        self.lines.push(line);
        self.instructions.len() - 1
    }

    /// Index of the next instruction to be emitted.
    pub fn pc(&self) -> usize {
        self.instructions.len()
    }

    pub fn add_constant(&mut self, value: Constant, line: u32) -> Result<u16, LuaError> {
        if let Some(idx) = self.constants.iter().position(|c| c.same_as(&value)) {
            return Ok(idx as u16);
        }
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(LuaError::Compile {
                line,
                message: format!("too many constants (limit is {MAX_CONSTANTS})"),
            });
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u16)
    }

    pub fn add_name(&mut self, name: &str, line: u32) -> Result<u16, LuaError> {
        if let Some(idx) = self.names.iter().position(|n| &**n == name) {
            return Ok(idx as u16);
        }
        if self.names.len() >= MAX_CONSTANTS {
            return Err(LuaError::Compile {
                line,
                message: format!("too many names (limit is {MAX_CONSTANTS})"),
            });
        }
        self.names.push(Rc::from(name));
        Ok((self.names.len() - 1) as u16)
    }

    pub fn add_proto(&mut self, proto: Rc<Proto>, line: u32) -> Result<u16, LuaError> {
        if self.protos.len() >= MAX_CONSTANTS {
            return Err(LuaError::Compile {
                line,
                message: "too many nested functions".into(),
            });
        }
        self.protos.push(proto);
        Ok((self.protos.len() - 1) as u16)
    }

    pub fn finish(self, frame_size: u8) -> Proto {
        Proto {
            instructions: self.instructions,
            lines: self.lines,
            constants: self.constants,
            names: self.names,
            protos: self.protos,
            upvalue_descs: self.upvalue_descs,
            upvalue_names: self.upvalue_names,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            frame_size,
            source: self.source,
            line_defined: self.line_defined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_and_names_deduplicate() {
        let mut b = ProtoBuilder::new(Rc::from("t"), 0);
        let a = b.add_constant(Constant::Number(1.0), 1).unwrap();
        let c = b.add_constant(Constant::Str("x".into()), 1).unwrap();
        assert_eq!(b.add_constant(Constant::Number(1.0), 1).unwrap(), a);
        assert_ne!(a, c);
        assert_eq!(b.add_name("print", 1).unwrap(), b.add_name("print", 2).unwrap());
    }

    #[test]
    fn emit_records_lines() {
        let mut b = ProtoBuilder::new(Rc::from("t"), 0);
        b.emit(OpCode::LoadNil { dst: 0, count: 1 }, 4);
        let pc = b.emit(OpCode::Return { src: 0, count: 1 }, 5);
        assert_eq!(pc, 1);
        let proto = b.finish(1);
        assert_eq!(proto.line_at(1), 5);
    }
}
