use crate::error::LoadError;
use crate::types::TypeRecord;
use std::fmt::{self, Display, Formatter};

/// The fixed single-byte opcode table. Byte values are part of the image
/// format contract with the front end and never change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Add = 0x01,
    Sub = 0x02,
    Mul = 0x03,
    Div = 0x04,
    Mod = 0x05,
    And = 0x06,
    Or = 0x07,
    Not = 0x08,
    Eq = 0x09,
    Neq = 0x0A,
    Lt = 0x0B,
    Gt = 0x0C,
    Le = 0x0D,
    Ge = 0x0E,
    Store = 0x0F,
    StoreFloat = 0x10,
    StoreMem = 0x11,
    Load = 0x12,
    Jump = 0x13,
    JumpIf = 0x14,
    Call = 0x15,
    Return = 0x16,
    BuildList = 0x17,
    ListAccess = 0x18,
    ListSet = 0x19,
    BuildStr = 0x1A,
    StoreChar = 0x1B,
    DefineType = 0x1C,
    New = 0x1D,
    StoreHeap = 0x1E,
    LoadHeap = 0x1F,
    Cast = 0x20,
    ObjCall = 0xFE,
    SysCall = 0xFF,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::Add),
            0x02 => Some(Opcode::Sub),
            0x03 => Some(Opcode::Mul),
            0x04 => Some(Opcode::Div),
            0x05 => Some(Opcode::Mod),
            0x06 => Some(Opcode::And),
            0x07 => Some(Opcode::Or),
            0x08 => Some(Opcode::Not),
            0x09 => Some(Opcode::Eq),
            0x0A => Some(Opcode::Neq),
            0x0B => Some(Opcode::Lt),
            0x0C => Some(Opcode::Gt),
            0x0D => Some(Opcode::Le),
            0x0E => Some(Opcode::Ge),
            0x0F => Some(Opcode::Store),
            0x10 => Some(Opcode::StoreFloat),
            0x11 => Some(Opcode::StoreMem),
            0x12 => Some(Opcode::Load),
            0x13 => Some(Opcode::Jump),
            0x14 => Some(Opcode::JumpIf),
            0x15 => Some(Opcode::Call),
            0x16 => Some(Opcode::Return),
            0x17 => Some(Opcode::BuildList),
            0x18 => Some(Opcode::ListAccess),
            0x19 => Some(Opcode::ListSet),
            0x1A => Some(Opcode::BuildStr),
            0x1B => Some(Opcode::StoreChar),
            0x1C => Some(Opcode::DefineType),
            0x1D => Some(Opcode::New),
            0x1E => Some(Opcode::StoreHeap),
            0x1F => Some(Opcode::LoadHeap),
            0x20 => Some(Opcode::Cast),
            0xFE => Some(Opcode::ObjCall),
            0xFF => Some(Opcode::SysCall),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Not => "NOT",
            Opcode::Eq => "EQ",
            Opcode::Neq => "NEQ",
            Opcode::Lt => "LT",
            Opcode::Gt => "GT",
            Opcode::Le => "LE",
            Opcode::Ge => "GE",
            Opcode::Store => "STORE",
            Opcode::StoreFloat => "STORE_FLOAT",
            Opcode::StoreMem => "STORE_MEM",
            Opcode::Load => "LOAD",
            Opcode::Jump => "JUMP",
            Opcode::JumpIf => "JUMP_IF",
            Opcode::Call => "CALL",
            Opcode::Return => "RETURN",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::ListAccess => "LIST_ACCESS",
            Opcode::ListSet => "LIST_SET",
            Opcode::BuildStr => "BUILD_STR",
            Opcode::StoreChar => "STORE_CHAR",
            Opcode::DefineType => "DEFINE_TYPE",
            Opcode::New => "NEW",
            Opcode::StoreHeap => "STORE_HEAP",
            Opcode::LoadHeap => "LOAD_HEAP",
            Opcode::Cast => "CAST",
            Opcode::ObjCall => "OBJCALL",
            Opcode::SysCall => "SYSCALL",
        }
    }
}

/// One decoded instruction. The wire encoding is fixed-width: the opcode
/// byte followed by the operand as a little-endian `i64`, 9 bytes total,
/// so jump targets always land on instruction boundaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: i64,
}

impl Instruction {
    pub const ENCODED_LEN: usize = 9;

    pub fn new(opcode: Opcode, operand: i64) -> Self {
        Self { opcode, operand }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::ENCODED_LEN);
        bytes.push(self.opcode as u8);
        bytes.extend_from_slice(&self.operand.to_le_bytes());
        bytes
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} {}", self.opcode.mnemonic(), self.operand)
    }
}

/// An entry of the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}

/// A catch range: a recoverable error raised at an ip inside
/// `[start, end)` resumes at `target` with the error kind name pushed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerRegion {
    pub start: u32,
    pub end: u32,
    pub target: u32,
}

/// One compiled function: entry in the function table that CALL, OBJCALL
/// and callable references index into.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub arity: usize,
    pub num_locals: usize,
    pub handlers: Vec<HandlerRegion>,
    pub code: Vec<Instruction>,
}

impl Function {
    /// First handler region covering `ip`, if any.
    pub fn handler_for(&self, ip: usize) -> Option<u32> {
        let ip = ip as u32;
        self.handlers
            .iter()
            .find(|region| region.start <= ip && ip < region.end)
            .map(|region| region.target)
    }
}

/// A complete loaded program: everything the front end hands the VM.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub constants: Vec<Constant>,
    pub types: Vec<TypeRecord>,
    pub functions: Vec<Function>,
    pub entry: u32,
}

impl Program {
    /// Structural validation run at load time so the dispatch loop can
    /// trust every operand-encoded index.
    pub fn validate(&self) -> Result<(), LoadError> {
        let entry = self
            .functions
            .get(self.entry as usize)
            .ok_or_else(|| Self::malformed(format!("entry function {} out of range", self.entry)))?;
        if entry.arity != 0 {
            return Err(Self::malformed(format!(
                "entry function {} must take no parameters",
                entry.name
            )));
        }

        for function in &self.functions {
            if function.arity > function.num_locals {
                return Err(Self::malformed(format!(
                    "function {}: arity {} exceeds {} locals",
                    function.name, function.arity, function.num_locals
                )));
            }
            for region in &function.handlers {
                if region.end as usize > function.code.len() || (region.target as usize) >= function.code.len() {
                    return Err(Self::malformed(format!(
                        "function {}: handler region out of range",
                        function.name
                    )));
                }
            }
            for (ip, instruction) in function.code.iter().enumerate() {
                self.validate_instruction(function, ip, *instruction)?;
            }
        }

        for record in &self.types {
            for (method, function_index) in &record.methods {
                let function = self.functions.get(*function_index as usize).ok_or_else(|| {
                    Self::malformed(format!(
                        "type {}: method {} references unknown function {}",
                        record.name, method, function_index
                    ))
                })?;
                if function.arity == 0 {
                    return Err(Self::malformed(format!(
                        "type {}: method {} must take a receiver",
                        record.name, method
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_instruction(
        &self,
        function: &Function,
        ip: usize,
        instruction: Instruction,
    ) -> Result<(), LoadError> {
        let operand = instruction.operand;
        let fail = |what: &str| {
            Err(Self::malformed(format!(
                "function {} at {:0>4}: {} ({})",
                function.name, ip, what, instruction
            )))
        };
        match instruction.opcode {
            Opcode::Store | Opcode::StoreFloat => {
                if operand < 0 || operand as usize >= self.constants.len() {
                    return fail("constant index out of range");
                }
            }
            Opcode::StoreMem | Opcode::Load => {
                if operand < 0 || operand as usize >= function.num_locals {
                    return fail("local slot out of range");
                }
            }
            Opcode::Jump | Opcode::JumpIf => {
                if operand < 0 || operand as usize >= function.code.len() {
                    return fail("jump target out of range");
                }
            }
            Opcode::Call => {
                if operand < 0 || operand as usize >= self.functions.len() {
                    return fail("function index out of range");
                }
            }
            Opcode::BuildList | Opcode::BuildStr => {
                if operand < 0 {
                    return fail("negative element count");
                }
            }
            Opcode::DefineType | Opcode::New => {
                if operand < 0 || operand as usize >= self.types.len() {
                    return fail("type record index out of range");
                }
            }
            Opcode::StoreHeap | Opcode::LoadHeap | Opcode::ObjCall => {
                // OBJCALL operands double as builtin ids for list/string
                // receivers, so only the sign can be checked up front.
                if operand < 0 || (instruction.opcode != Opcode::ObjCall
                    && operand as usize >= self.constants.len())
                {
                    return fail("field name constant out of range");
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn disassemble(&self) -> String {
        self.functions
            .iter()
            .map(|function| {
                let header = format!(
                    "{} (arity {}, locals {}):",
                    function.name, function.arity, function.num_locals
                );
                let body = function
                    .code
                    .iter()
                    .enumerate()
                    .map(|(ip, instruction)| format!("  {:0>4} {}", ip, instruction))
                    .collect::<Vec<String>>()
                    .join("\n");
                format!("{}\n{}", header, body)
            })
            .collect::<Vec<String>>()
            .join("\n")
    }

    fn malformed(message: String) -> LoadError {
        LoadError::Malformed(message)
    }
}
