//! Program image reader and writer.
//!
//! Layout (all multi-byte integers little-endian):
//!
//! ```text
//! magic "RIME" | version u8
//! constants: count u32, then per entry a tag byte
//!   0 int i64 | 1 float f64 | 2 bool u8 | 3 str (len u32 + utf-8) | 4 null
//! types: count u32, then per record
//!   name str | parent flag u8 (+ str) | fields (count u32 × str + kind u8)
//!   | methods (count u32 × str + function index u32)
//! functions: count u32, then per function
//!   name str | arity u32 | locals u32 | handlers (count u32 × 3 × u32)
//!   | code (count u32 × 9-byte records: opcode u8 + operand i64)
//! entry function index u32
//! ```
//!
//! Loading performs structural validation only; the type table the
//! records describe is registered by the VM before execution starts,
//! and a registration failure there is equally fatal.

use crate::bytecode::{Constant, Function, HandlerRegion, Instruction, Opcode, Program};
use crate::error::LoadError;
use crate::types::{FieldKind, TypeRecord};
use std::path::Path;
use tracing::debug;

const IMAGE_MAGIC: &[u8; 4] = b"RIME";
const IMAGE_VERSION: u8 = 1;

pub fn load_file(path: impl AsRef<Path>) -> Result<Program, LoadError> {
    let bytes = std::fs::read(path)?;
    load(&bytes)
}

/// Decode and validate a program image.
pub fn load(bytes: &[u8]) -> Result<Program, LoadError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(4)?;
    if magic != IMAGE_MAGIC {
        return Err(LoadError::InvalidMagic);
    }
    let version = reader.read_u8()?;
    if version != IMAGE_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let constant_count = reader.read_u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        constants.push(reader.read_constant()?);
    }

    let type_count = reader.read_u32()? as usize;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        types.push(reader.read_type_record()?);
    }

    let function_count = reader.read_u32()? as usize;
    let mut functions = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        functions.push(reader.read_function()?);
    }

    let entry = reader.read_u32()?;

    let program = Program {
        constants,
        types,
        functions,
        entry,
    };
    program.validate()?;

    debug!(
        constants = program.constants.len(),
        types = program.types.len(),
        functions = program.functions.len(),
        "loaded program image"
    );
    Ok(program)
}

/// Encode a program into the image format `load` reads.
pub fn encode(program: &Program) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(IMAGE_MAGIC);
    bytes.push(IMAGE_VERSION);

    bytes.extend_from_slice(&(program.constants.len() as u32).to_le_bytes());
    for constant in &program.constants {
        match constant {
            Constant::Int(v) => {
                bytes.push(0);
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            Constant::Float(v) => {
                bytes.push(1);
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            Constant::Bool(v) => {
                bytes.push(2);
                bytes.push(*v as u8);
            }
            Constant::Str(v) => {
                bytes.push(3);
                write_str(&mut bytes, v);
            }
            Constant::Null => bytes.push(4),
        }
    }

    bytes.extend_from_slice(&(program.types.len() as u32).to_le_bytes());
    for record in &program.types {
        write_str(&mut bytes, &record.name);
        match &record.parent {
            Some(parent) => {
                bytes.push(1);
                write_str(&mut bytes, parent);
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&(record.fields.len() as u32).to_le_bytes());
        for (name, kind) in &record.fields {
            write_str(&mut bytes, name);
            bytes.push(kind.as_byte());
        }
        bytes.extend_from_slice(&(record.methods.len() as u32).to_le_bytes());
        for (name, function_index) in &record.methods {
            write_str(&mut bytes, name);
            bytes.extend_from_slice(&function_index.to_le_bytes());
        }
    }

    bytes.extend_from_slice(&(program.functions.len() as u32).to_le_bytes());
    for function in &program.functions {
        write_str(&mut bytes, &function.name);
        bytes.extend_from_slice(&(function.arity as u32).to_le_bytes());
        bytes.extend_from_slice(&(function.num_locals as u32).to_le_bytes());
        bytes.extend_from_slice(&(function.handlers.len() as u32).to_le_bytes());
        for region in &function.handlers {
            bytes.extend_from_slice(&region.start.to_le_bytes());
            bytes.extend_from_slice(&region.end.to_le_bytes());
            bytes.extend_from_slice(&region.target.to_le_bytes());
        }
        bytes.extend_from_slice(&(function.code.len() as u32).to_le_bytes());
        for instruction in &function.code {
            bytes.extend_from_slice(&instruction.as_bytes());
        }
    }

    bytes.extend_from_slice(&program.entry.to_le_bytes());
    bytes
}

fn write_str(bytes: &mut Vec<u8>, text: &str) {
    bytes.extend_from_slice(&(text.len() as u32).to_le_bytes());
    bytes.extend_from_slice(text.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        if self.cursor + len > self.bytes.len() {
            return Err(LoadError::Truncated);
        }
        let slice = &self.bytes[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, LoadError> {
        let slice = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slice);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_f64(&mut self) -> Result<f64, LoadError> {
        let slice = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slice);
        Ok(f64::from_le_bytes(raw))
    }

    fn read_str(&mut self) -> Result<String, LoadError> {
        let len = self.read_u32()? as usize;
        let slice = self.take(len)?;
        String::from_utf8(slice.to_vec())
            .map_err(|_| LoadError::Malformed("invalid utf-8 in string".into()))
    }

    fn read_constant(&mut self) -> Result<Constant, LoadError> {
        match self.read_u8()? {
            0 => Ok(Constant::Int(self.read_i64()?)),
            1 => Ok(Constant::Float(self.read_f64()?)),
            2 => Ok(Constant::Bool(self.read_u8()? != 0)),
            3 => Ok(Constant::Str(self.read_str()?)),
            4 => Ok(Constant::Null),
            tag => Err(LoadError::Malformed(format!(
                "unknown constant tag: {}",
                tag
            ))),
        }
    }

    fn read_type_record(&mut self) -> Result<TypeRecord, LoadError> {
        let name = self.read_str()?;
        let parent = match self.read_u8()? {
            0 => None,
            1 => Some(self.read_str()?),
            flag => {
                return Err(LoadError::Malformed(format!(
                    "unknown parent flag: {}",
                    flag
                )))
            }
        };
        let field_count = self.read_u32()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field = self.read_str()?;
            let kind_byte = self.read_u8()?;
            let kind = FieldKind::from_byte(kind_byte).ok_or_else(|| {
                LoadError::Malformed(format!("unknown field kind: {}", kind_byte))
            })?;
            fields.push((field, kind));
        }
        let method_count = self.read_u32()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let method = self.read_str()?;
            let function_index = self.read_u32()?;
            methods.push((method, function_index));
        }
        Ok(TypeRecord {
            name,
            parent,
            fields,
            methods,
        })
    }

    fn read_function(&mut self) -> Result<Function, LoadError> {
        let name = self.read_str()?;
        let arity = self.read_u32()? as usize;
        let num_locals = self.read_u32()? as usize;
        let handler_count = self.read_u32()? as usize;
        let mut handlers = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            handlers.push(HandlerRegion {
                start: self.read_u32()?,
                end: self.read_u32()?,
                target: self.read_u32()?,
            });
        }
        let code_count = self.read_u32()? as usize;
        let mut code = Vec::with_capacity(code_count);
        for _ in 0..code_count {
            let byte = self.read_u8()?;
            let opcode = Opcode::from_byte(byte).ok_or(LoadError::UnknownOpcode(byte))?;
            let operand = self.read_i64()?;
            code.push(Instruction::new(opcode, operand));
        }
        Ok(Function {
            name,
            arity,
            num_locals,
            handlers,
            code,
        })
    }
}
