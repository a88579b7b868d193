use crate::bytecode::{Constant, Instruction, Opcode, Program};
use crate::config::VmConfig;
use crate::error::{Diagnostic, FrameTrace, LoadError, RuntimeError};
use crate::heap::{Heap, HeapId, HeapObject, Instance};
use crate::types::{FieldKind, TypeTable};
use crate::value::Value;
use std::io::{self, BufRead, BufReader, Write};
use tracing::{debug, trace};

/// One function activation. Locals and operands live on the shared
/// value stack above `base_pointer`: parameter and local slots first,
/// the operand region after them. The caller's resume point is implicit
/// in the frame below this one.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function_index: u32,
    pub ip: usize,
    pub base_pointer: usize,
}

impl Frame {
    pub fn new(function_index: u32, base_pointer: usize) -> Self {
        Self {
            function_index,
            ip: 0,
            base_pointer,
        }
    }
}

/// The Rime virtual machine. Owns one heap and one call stack; a host
/// running several programs creates one instance per program, and no
/// heap identifier is meaningful across instances.
pub struct VirtualMachine {
    program: Program,
    types: TypeTable,
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_pointer: usize,
    frames: Vec<Frame>,
    config: VmConfig,
    pub(crate) stdin: Box<dyn BufRead>,
    pub(crate) stdout: Box<dyn Write>,
    pub(crate) exit_status: Option<i64>,
    fault: Option<Diagnostic>,
}

impl VirtualMachine {
    /// Build a VM for a program. Validates its structure and registers
    /// its type records; a malformed operand, duplicate type name,
    /// missing parent, or inheritance cycle is fatal here and the
    /// program never begins executing.
    pub fn new(program: Program) -> Result<Self, LoadError> {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Program, config: VmConfig) -> Result<Self, LoadError> {
        // Embedders can hand us a program the loader never saw; the
        // dispatch loop trusts validated operands either way.
        program.validate()?;
        let mut types = TypeTable::new();
        for record in &program.types {
            types
                .register(record)
                .map_err(|err| LoadError::TypeTable(err.to_string()))?;
        }

        Ok(Self {
            program,
            types,
            heap: Heap::new(),
            stack: Vec::with_capacity(256),
            stack_pointer: 0,
            frames: Vec::new(),
            config,
            stdin: Box::new(BufReader::new(io::stdin())),
            stdout: Box::new(io::stdout()),
            exit_status: None,
            fault: None,
        })
    }

    pub fn set_input(&mut self, stdin: Box<dyn BufRead>) {
        self.stdin = stdin;
    }

    pub fn set_output(&mut self, stdout: Box<dyn Write>) {
        self.stdout = stdout;
    }

    /// Execute the program to completion and return its exit status
    /// (zero unless the `exit` syscall ran). Errors that no handler
    /// region caught come back as a [`Diagnostic`].
    pub fn run(&mut self) -> Result<i64, Diagnostic> {
        debug!(entry = self.program.entry, "starting dispatch loop");
        if let Err(error) = self.call_function(self.program.entry) {
            return Err(Diagnostic::new(error));
        }
        match self.drive(0) {
            Ok(()) => Ok(self.exit_status.unwrap_or(0)),
            Err(error) => Err(self
                .fault
                .take()
                .unwrap_or_else(|| Diagnostic::new(error))),
        }
    }

    /// Value left on the stack after the entry function returned.
    pub fn stack_top(&self) -> Result<Value, RuntimeError> {
        if self.stack_pointer == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack[self.stack_pointer - 1])
    }

    /// Fetch-decode-execute until the frame stack drops back to
    /// `floor`. Nested activations (map/filter callables, instance
    /// methods invoked natively) re-enter here with a higher floor so
    /// unwinding never crosses into their caller's frames.
    fn drive(&mut self, floor: usize) -> Result<(), RuntimeError> {
        while self.frames.len() > floor && self.exit_status.is_none() {
            if self.heap.should_collect(self.config.gc_threshold) {
                self.heap.collect(&self.stack[..self.stack_pointer]);
            }

            let (function_index, ip) = match self.frames.last() {
                Some(frame) => (frame.function_index as usize, frame.ip),
                None => break,
            };
            if ip >= self.program.functions[function_index].code.len() {
                // Falling off the end behaves as RETURN.
                self.do_return()?;
                continue;
            }
            let instruction = self.program.functions[function_index].code[ip];
            if let Some(frame) = self.frames.last_mut() {
                frame.ip = ip + 1;
            }

            if let Err(error) = self.execute_instruction(instruction) {
                self.handle_fault(error, floor, instruction)?;
            }
        }
        Ok(())
    }

    fn execute_instruction(&mut self, instruction: Instruction) -> Result<(), RuntimeError> {
        match instruction.opcode {
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.arithmetic(left, right, instruction.opcode)?;
                self.push(result)
            }
            Opcode::And | Opcode::Or => {
                let right = self.pop_bool(instruction.opcode.mnemonic())?;
                let left = self.pop_bool(instruction.opcode.mnemonic())?;
                let result = match instruction.opcode {
                    Opcode::And => left && right,
                    _ => left || right,
                };
                self.push(Value::Bool(result))
            }
            Opcode::Not => {
                let operand = self.pop_bool("NOT")?;
                self.push(Value::Bool(!operand))
            }
            Opcode::Eq | Opcode::Neq => {
                let right = self.pop()?;
                let left = self.pop()?;
                let equal = self.values_equal(left, right)?;
                self.push(Value::Bool(if instruction.opcode == Opcode::Eq {
                    equal
                } else {
                    !equal
                }))
            }
            Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.compare(left, right, instruction.opcode)?;
                self.push(result)
            }
            Opcode::Store => {
                let value = self.constant_value(instruction.operand)?;
                self.push(value)
            }
            Opcode::StoreFloat => {
                let constant = self.constant(instruction.operand)?.clone();
                match constant {
                    Constant::Float(v) => self.push(Value::Float(v)),
                    other => Err(RuntimeError::TypeError(format!(
                        "STORE_FLOAT requires a float constant, found {:?}",
                        other
                    ))),
                }
            }
            Opcode::StoreMem => {
                let value = self.pop()?;
                let slot = self.local_slot(instruction.operand)?;
                self.stack[slot] = value;
                Ok(())
            }
            Opcode::Load => {
                let slot = self.local_slot(instruction.operand)?;
                let value = self.stack[slot];
                self.push(value)
            }
            Opcode::Jump => {
                self.current_frame_mut()?.ip = instruction.operand as usize;
                Ok(())
            }
            Opcode::JumpIf => {
                let condition = self.pop_bool("JUMP_IF")?;
                if condition {
                    self.current_frame_mut()?.ip = instruction.operand as usize;
                }
                Ok(())
            }
            Opcode::Call => self.call_function(instruction.operand as u32),
            Opcode::Return => self.do_return(),
            Opcode::BuildList => {
                let count = instruction.operand as usize;
                let start = self.popped_region(count)?;
                let elements = self.stack[start..self.stack_pointer].to_vec();
                self.stack_pointer = start;
                let id = self.heap.allocate(HeapObject::List(elements));
                self.push(Value::ListRef(id))
            }
            Opcode::ListAccess => {
                let index = self.operand_or_popped_index(instruction.operand)?;
                let receiver = self.pop()?;
                match receiver {
                    Value::ListRef(id) => {
                        let elements = self.heap.list(id)?;
                        let slot = bounds_checked(index, elements.len())?;
                        let value = elements[slot];
                        self.push(value)
                    }
                    Value::StringRef(id) => {
                        let chars = self.heap.string(id)?;
                        let slot = bounds_checked(index, chars.len())?;
                        let text = chars[slot].to_string();
                        let new_id = self.heap.allocate_string(&text);
                        self.push(Value::StringRef(new_id))
                    }
                    other => Err(RuntimeError::TypeError(format!(
                        "LIST_ACCESS requires a list or string, found {}",
                        other.kind_name()
                    ))),
                }
            }
            Opcode::ListSet => {
                let index = self.operand_or_popped_index(instruction.operand)?;
                let receiver = self.pop()?;
                let value = self.pop()?;
                match receiver {
                    Value::ListRef(id) => {
                        let elements = self.heap.list_mut(id)?;
                        let slot = bounds_checked(index, elements.len())?;
                        elements[slot] = value;
                        Ok(())
                    }
                    other => Err(RuntimeError::TypeError(format!(
                        "LIST_SET requires a list, found {}",
                        other.kind_name()
                    ))),
                }
            }
            Opcode::BuildStr => {
                let count = instruction.operand as usize;
                let start = self.popped_region(count)?;
                let mut text = String::new();
                for slot in start..self.stack_pointer {
                    match self.stack[slot] {
                        Value::Int(code) => text.push(char_from_code(code)?),
                        Value::StringRef(id) => text.extend(self.heap.string(id)?),
                        other => {
                            return Err(RuntimeError::TypeError(format!(
                                "BUILD_STR requires character codes or strings, found {}",
                                other.kind_name()
                            )))
                        }
                    }
                }
                self.stack_pointer = start;
                let id = self.heap.allocate_string(&text);
                self.push(Value::StringRef(id))
            }
            Opcode::StoreChar => {
                let index = self.operand_or_popped_index(instruction.operand)?;
                let code = self.pop_int("STORE_CHAR")?;
                let receiver = self.pop()?;
                let id = match receiver {
                    Value::StringRef(id) => id,
                    other => {
                        return Err(RuntimeError::TypeError(format!(
                            "STORE_CHAR requires a string, found {}",
                            other.kind_name()
                        )))
                    }
                };
                let replacement = char_from_code(code)?;
                let chars = self.heap.string_mut(id)?;
                let slot = bounds_checked(index, chars.len())?;
                chars[slot] = replacement;
                self.push(receiver)
            }
            Opcode::DefineType => {
                // The loader registers every record before execution, so
                // reaching this opcode is always a duplicate definition.
                let record = self
                    .program
                    .types
                    .get(instruction.operand as usize)
                    .cloned()
                    .ok_or_else(|| {
                        RuntimeError::TypeError(format!(
                            "type record index out of range: {}",
                            instruction.operand
                        ))
                    })?;
                self.types.register(&record)?;
                Ok(())
            }
            Opcode::New => {
                let type_id = instruction.operand as u32;
                let kinds: Vec<FieldKind> = self
                    .types
                    .get(type_id)?
                    .fields
                    .iter()
                    .map(|(_, kind)| *kind)
                    .collect();
                let fields = kinds.into_iter().map(|kind| self.zero_value(kind)).collect();
                let id = self
                    .heap
                    .allocate(HeapObject::Instance(Instance { type_id, fields }));
                self.push(Value::ObjectRef(id))
            }
            Opcode::StoreHeap => {
                let name = self.constant_str(instruction.operand)?;
                let object = self.pop()?;
                let value = self.pop()?;
                let slot = self.field_slot_of(object, &name)?;
                let id = object.heap_id().unwrap_or_default();
                self.heap.instance_mut(id)?.fields[slot] = value;
                Ok(())
            }
            Opcode::LoadHeap => {
                let name = self.constant_str(instruction.operand)?;
                let object = self.pop()?;
                let slot = self.field_slot_of(object, &name)?;
                let id = object.heap_id().unwrap_or_default();
                let value = self.heap.instance(id)?.fields[slot];
                self.push(value)
            }
            Opcode::Cast => {
                let value = self.pop()?;
                let result = self.cast_value(value, instruction.operand)?;
                self.push(result)
            }
            Opcode::ObjCall => {
                let receiver = self.pop()?;
                match receiver {
                    Value::StringRef(_) | Value::ListRef(_) => {
                        self.call_builtin_method(receiver, instruction.operand)
                    }
                    Value::ObjectRef(id) => self.call_instance_method(id, instruction.operand),
                    other => Err(RuntimeError::TypeError(format!(
                        "OBJCALL requires an object, list, or string receiver, found {}",
                        other.kind_name()
                    ))),
                }
            }
            Opcode::SysCall => self.syscall(instruction.operand),
        }
    }

    /// A recoverable error searches for a handler region from the
    /// faulting frame outward, never below `floor`. The first match
    /// resumes there with the operand stack cut back to the frame's
    /// locals and the error kind name pushed. With no match the error
    /// becomes a top-level diagnostic.
    fn handle_fault(
        &mut self,
        error: RuntimeError,
        floor: usize,
        instruction: Instruction,
    ) -> Result<(), RuntimeError> {
        let trace = self.capture_trace();
        if error.is_recoverable() {
            while self.frames.len() > floor {
                let (handler, base_pointer, num_locals) = match self.frames.last() {
                    Some(frame) => {
                        let function = &self.program.functions[frame.function_index as usize];
                        (
                            function.handler_for(frame.ip.saturating_sub(1)),
                            frame.base_pointer,
                            function.num_locals,
                        )
                    }
                    None => break,
                };
                if let Some(target) = handler {
                    self.stack_pointer = base_pointer + num_locals;
                    let id = self.heap.allocate_string(error.kind_name());
                    self.push(Value::StringRef(id))?;
                    if let Some(frame) = self.frames.last_mut() {
                        frame.ip = target as usize;
                    }
                    self.fault = None;
                    trace!(error = %error, target, "handler region caught error");
                    return Ok(());
                }
                if let Some(frame) = self.frames.pop() {
                    self.stack_pointer = frame.base_pointer;
                }
            }
        }
        if self.fault.is_none() {
            self.fault = Some(Diagnostic {
                error: error.clone(),
                instruction: Some(instruction),
                trace,
            });
        }
        Err(error)
    }

    fn capture_trace(&self) -> Vec<FrameTrace> {
        self.frames
            .iter()
            .rev()
            .map(|frame| FrameTrace {
                function: self.program.functions[frame.function_index as usize]
                    .name
                    .clone(),
                ip: frame.ip.saturating_sub(1),
            })
            .collect()
    }

    // ---- call protocol -------------------------------------------------

    /// Push a frame for `function_index`, binding the callee's arity
    /// worth of stack values as its leftmost parameter slots and
    /// clearing the remaining locals.
    pub(crate) fn call_function(&mut self, function_index: u32) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::StackOverflow(self.config.max_call_depth));
        }
        let function = self
            .program
            .functions
            .get(function_index as usize)
            .ok_or_else(|| {
                RuntimeError::TypeError(format!("unknown function index: {}", function_index))
            })?;
        let arity = function.arity;
        let num_locals = function.num_locals;
        // Arguments must come from the calling frame's operand region,
        // never its local slots.
        if self.stack_pointer < self.operand_floor() + arity {
            return Err(RuntimeError::StackUnderflow);
        }
        let base_pointer = self.stack_pointer - arity;
        if base_pointer + num_locals > self.config.max_stack_size {
            return Err(RuntimeError::StackOverflow(self.config.max_stack_size));
        }

        self.frames.push(Frame::new(function_index, base_pointer));
        self.stack_pointer = base_pointer + num_locals;
        while self.stack.len() < self.stack_pointer {
            self.stack.push(Value::Null);
        }
        for slot in (base_pointer + arity)..self.stack_pointer {
            self.stack[slot] = Value::Null;
        }
        Ok(())
    }

    fn do_return(&mut self) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
        let num_locals = self.program.functions[frame.function_index as usize].num_locals;
        let return_value = if self.stack_pointer > frame.base_pointer + num_locals {
            self.stack[self.stack_pointer - 1]
        } else {
            Value::Null
        };
        self.stack_pointer = frame.base_pointer;
        self.push(return_value)
    }

    /// Run a callable reference (a function-table index) to completion
    /// with one argument and hand back its return value. Used by the
    /// `map`/`filter` built-ins; the nested activation shares the stack
    /// and heap but unwinds independently of the caller's frames.
    pub(crate) fn invoke_callable(
        &mut self,
        function_index: u32,
        argument: Value,
    ) -> Result<Value, RuntimeError> {
        let function = self
            .program
            .functions
            .get(function_index as usize)
            .ok_or_else(|| {
                RuntimeError::TypeError(format!("unknown function index: {}", function_index))
            })?;
        if function.arity != 1 {
            return Err(RuntimeError::TypeError(format!(
                "callable {} must take exactly one parameter",
                function.name
            )));
        }
        let floor = self.frames.len();
        self.push(argument)?;
        self.call_function(function_index)?;
        self.drive(floor)?;
        if self.exit_status.is_some() {
            return Ok(Value::Null);
        }
        self.pop()
    }

    // ---- coercion engine -----------------------------------------------

    fn arithmetic(
        &mut self,
        left: Value,
        right: Value,
        opcode: Opcode,
    ) -> Result<Value, RuntimeError> {
        match (left, right) {
            (Value::Int(l), Value::Int(r)) => match opcode {
                Opcode::Add => Ok(Value::Int(l.wrapping_add(r))),
                Opcode::Sub => Ok(Value::Int(l.wrapping_sub(r))),
                Opcode::Mul => Ok(Value::Int(l.wrapping_mul(r))),
                Opcode::Div => {
                    if r == 0 {
                        Err(RuntimeError::DivisionByZero)
                    } else if l % r == 0 {
                        Ok(Value::Int(l / r))
                    } else {
                        Ok(Value::Float(l as f64 / r as f64))
                    }
                }
                _ => {
                    if r == 0 {
                        Err(RuntimeError::DivisionByZero)
                    } else {
                        Ok(Value::Int(l % r))
                    }
                }
            },
            (Value::StringRef(l), Value::StringRef(r)) if opcode == Opcode::Add => {
                let mut text: String = self.heap.string(l)?.iter().collect();
                text.extend(self.heap.string(r)?);
                let id = self.heap.allocate_string(&text);
                Ok(Value::StringRef(id))
            }
            (Value::StringRef(l), scalar)
                if opcode == Opcode::Add && !matches!(scalar, Value::ListRef(_) | Value::ObjectRef(_)) =>
            {
                let mut text: String = self.heap.string(l)?.iter().collect();
                text.push_str(&self.format_value(scalar)?);
                let id = self.heap.allocate_string(&text);
                Ok(Value::StringRef(id))
            }
            (scalar, Value::StringRef(r))
                if opcode == Opcode::Add && !matches!(scalar, Value::ListRef(_) | Value::ObjectRef(_)) =>
            {
                let mut text = self.format_value(scalar)?;
                text.extend(self.heap.string(r)?);
                let id = self.heap.allocate_string(&text);
                Ok(Value::StringRef(id))
            }
            (l, r) if l.is_numeric() && r.is_numeric() => {
                let (l, r) = (l.as_f64(), r.as_f64());
                match opcode {
                    Opcode::Add => Ok(Value::Float(l + r)),
                    Opcode::Sub => Ok(Value::Float(l - r)),
                    Opcode::Mul => Ok(Value::Float(l * r)),
                    Opcode::Div => {
                        if r == 0.0 {
                            Err(RuntimeError::DivisionByZero)
                        } else {
                            Ok(Value::Float(l / r))
                        }
                    }
                    _ => Err(RuntimeError::TypeError(
                        "MOD is defined only for int operands".into(),
                    )),
                }
            }
            (l, r) => Err(RuntimeError::TypeError(format!(
                "cannot apply {} to {} and {}",
                opcode.mnemonic(),
                l.kind_name(),
                r.kind_name()
            ))),
        }
    }

    fn values_equal(&self, left: Value, right: Value) -> Result<bool, RuntimeError> {
        Ok(match (left, right) {
            (Value::Int(l), Value::Int(r)) => l == r,
            (Value::Float(l), Value::Float(r)) => l == r,
            (Value::Bool(l), Value::Bool(r)) => l == r,
            (Value::StringRef(l), Value::StringRef(r)) => {
                self.heap.string(l)? == self.heap.string(r)?
            }
            (Value::ListRef(l), Value::ListRef(r)) => l == r,
            (Value::ObjectRef(l), Value::ObjectRef(r)) => l == r,
            (Value::Null, Value::Null) => true,
            // Cross-kind comparison is defined, not an error.
            _ => false,
        })
    }

    fn compare(&self, left: Value, right: Value, opcode: Opcode) -> Result<Value, RuntimeError> {
        let ordering = match (left, right) {
            (Value::Int(l), Value::Int(r)) => l.cmp(&r),
            (Value::StringRef(l), Value::StringRef(r)) => {
                self.heap.string(l)?.cmp(self.heap.string(r)?)
            }
            (l, r) if l.is_numeric() && r.is_numeric() => l
                .as_f64()
                .partial_cmp(&r.as_f64())
                .ok_or_else(|| RuntimeError::TypeError("cannot order NaN".into()))?,
            (l, r) => {
                return Err(RuntimeError::TypeError(format!(
                    "cannot order {} and {}",
                    l.kind_name(),
                    r.kind_name()
                )))
            }
        };
        Ok(Value::Bool(match opcode {
            Opcode::Lt => ordering.is_lt(),
            Opcode::Gt => ordering.is_gt(),
            Opcode::Le => ordering.is_le(),
            _ => ordering.is_ge(),
        }))
    }

    /// The fixed cast table over the four scalar-compatible kinds.
    /// Target codes: 0 int, 1 float, 2 bool, 3 string.
    fn cast_value(&mut self, value: Value, target: i64) -> Result<Value, RuntimeError> {
        if matches!(value, Value::ListRef(_) | Value::ObjectRef(_) | Value::Null) {
            return Err(RuntimeError::TypeError(format!(
                "cannot cast {}",
                value.kind_name()
            )));
        }
        match target {
            0 => Ok(Value::Int(match value {
                Value::Int(v) => v,
                Value::Float(v) => v.trunc() as i64,
                Value::Bool(v) => v as i64,
                Value::StringRef(id) => {
                    let text: String = self.heap.string(id)?.iter().collect();
                    text.parse::<i64>().map_err(|_| {
                        RuntimeError::CastError(format!("cannot cast \"{}\" to int", text))
                    })?
                }
                _ => unreachable!("reference kinds rejected above"),
            })),
            1 => Ok(Value::Float(match value {
                Value::Int(v) => v as f64,
                Value::Float(v) => v,
                Value::Bool(v) => v as i64 as f64,
                Value::StringRef(id) => {
                    let text: String = self.heap.string(id)?.iter().collect();
                    text.parse::<f64>().map_err(|_| {
                        RuntimeError::CastError(format!("cannot cast \"{}\" to float", text))
                    })?
                }
                _ => unreachable!("reference kinds rejected above"),
            })),
            2 => Ok(Value::Bool(match value {
                Value::Int(v) => v != 0,
                Value::Float(v) => v != 0.0,
                Value::Bool(v) => v,
                Value::StringRef(id) => {
                    let text: String = self.heap.string(id)?.iter().collect();
                    match text.as_str() {
                        "True" => true,
                        "False" => false,
                        _ => {
                            return Err(RuntimeError::CastError(format!(
                                "cannot cast \"{}\" to bool",
                                text
                            )))
                        }
                    }
                }
                _ => unreachable!("reference kinds rejected above"),
            })),
            3 => match value {
                Value::StringRef(_) => Ok(value),
                scalar => {
                    let text = self.format_value(scalar)?;
                    let id = self.heap.allocate_string(&text);
                    Ok(Value::StringRef(id))
                }
            },
            _ => Err(RuntimeError::TypeError(format!(
                "unknown cast target: {}",
                target
            ))),
        }
    }

    // ---- stack and frame plumbing --------------------------------------

    pub(crate) fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack_pointer >= self.config.max_stack_size {
            return Err(RuntimeError::StackOverflow(self.config.max_stack_size));
        }
        if self.stack_pointer >= self.stack.len() {
            self.stack.push(value);
        } else {
            self.stack[self.stack_pointer] = value;
        }
        self.stack_pointer += 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.stack_pointer <= self.operand_floor() {
            return Err(RuntimeError::StackUnderflow);
        }
        self.stack_pointer -= 1;
        Ok(self.stack[self.stack_pointer])
    }

    pub(crate) fn pop_int(&mut self, context: &str) -> Result<i64, RuntimeError> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(RuntimeError::TypeError(format!(
                "{} requires an int, found {}",
                context,
                other.kind_name()
            ))),
        }
    }

    fn pop_bool(&mut self, context: &str) -> Result<bool, RuntimeError> {
        match self.pop()? {
            Value::Bool(v) => Ok(v),
            other => Err(RuntimeError::TypeError(format!(
                "{} requires a bool, found {}",
                context,
                other.kind_name()
            ))),
        }
    }

    fn popped_region(&self, count: usize) -> Result<usize, RuntimeError> {
        let floor = self.operand_floor();
        if self.stack_pointer < floor + count {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack_pointer - count)
    }

    /// The current frame may not pop into its own local slots; that
    /// boundary is what turns a stack-discipline bug in the generated
    /// code into `StackUnderflow` instead of silent corruption.
    pub(crate) fn operand_floor(&self) -> usize {
        match self.frames.last() {
            Some(frame) => {
                frame.base_pointer
                    + self.program.functions[frame.function_index as usize].num_locals
            }
            None => 0,
        }
    }

    fn current_frame_mut(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames.last_mut().ok_or(RuntimeError::StackUnderflow)
    }

    fn local_slot(&self, operand: i64) -> Result<usize, RuntimeError> {
        let frame = self.frames.last().ok_or(RuntimeError::StackUnderflow)?;
        let num_locals = self.program.functions[frame.function_index as usize].num_locals;
        if operand < 0 || operand as usize >= num_locals {
            return Err(RuntimeError::IndexError {
                index: operand,
                len: num_locals,
            });
        }
        Ok(frame.base_pointer + operand as usize)
    }

    fn operand_or_popped_index(&mut self, operand: i64) -> Result<i64, RuntimeError> {
        if operand == -1 {
            self.pop_int("index")
        } else {
            Ok(operand)
        }
    }

    // ---- shared lookups ------------------------------------------------

    pub(crate) fn constant(&self, index: i64) -> Result<&Constant, RuntimeError> {
        self.program
            .constants
            .get(index as usize)
            .ok_or_else(|| RuntimeError::TypeError(format!("constant index out of range: {}", index)))
    }

    fn constant_value(&mut self, index: i64) -> Result<Value, RuntimeError> {
        let constant = self.constant(index)?.clone();
        Ok(match constant {
            Constant::Int(v) => Value::Int(v),
            Constant::Float(v) => Value::Float(v),
            Constant::Bool(v) => Value::Bool(v),
            Constant::Str(text) => Value::StringRef(self.heap.allocate_string(&text)),
            Constant::Null => Value::Null,
        })
    }

    pub(crate) fn constant_str(&self, index: i64) -> Result<String, RuntimeError> {
        match self.constant(index)? {
            Constant::Str(text) => Ok(text.clone()),
            other => Err(RuntimeError::TypeError(format!(
                "expected a string constant at index {}, found {:?}",
                index, other
            ))),
        }
    }

    pub(crate) fn field_slot_of(&self, object: Value, name: &str) -> Result<usize, RuntimeError> {
        let id = match object {
            Value::ObjectRef(id) => id,
            other => {
                return Err(RuntimeError::TypeError(format!(
                    "field access requires an object, found {}",
                    other.kind_name()
                )))
            }
        };
        let type_id = self.heap.instance(id)?.type_id;
        let descriptor = self.types.get(type_id)?;
        descriptor.field_slot(name).ok_or_else(|| {
            RuntimeError::FieldNotFound(format!("{} on {}", name, descriptor.name))
        })
    }

    pub(crate) fn resolve_method(
        &self,
        type_id: u32,
        name: &str,
    ) -> Result<u32, RuntimeError> {
        self.types.resolve_method(type_id, name)
    }

    pub(crate) fn function_arity(&self, function_index: u32) -> Result<usize, RuntimeError> {
        self.program
            .functions
            .get(function_index as usize)
            .map(|function| function.arity)
            .ok_or_else(|| {
                RuntimeError::TypeError(format!("unknown function index: {}", function_index))
            })
    }

    pub(crate) fn type_name(&self, type_id: u32) -> Result<&str, RuntimeError> {
        Ok(&self.types.get(type_id)?.name)
    }

    fn zero_value(&mut self, kind: FieldKind) -> Value {
        match kind {
            FieldKind::Int => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Str => Value::StringRef(self.heap.allocate_string("")),
            FieldKind::Any => Value::Null,
        }
    }

    /// Canonical formatting: what `print`, `toString`, string casts and
    /// string concatenation all agree on.
    pub(crate) fn format_value(&self, value: Value) -> Result<String, RuntimeError> {
        Ok(match value {
            Value::StringRef(id) => self.heap.string(id)?.iter().collect(),
            Value::ListRef(id) => self.format_list(id)?,
            Value::ObjectRef(id) => {
                let instance = self.heap.instance(id)?;
                let name = &self.types.get(instance.type_id)?.name;
                let fields = instance
                    .fields
                    .iter()
                    .map(|field| self.format_value(*field))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("{} {{ {} }}", name, fields.join(", "))
            }
            scalar => scalar.to_string(),
        })
    }

    pub(crate) fn format_list(&self, id: HeapId) -> Result<String, RuntimeError> {
        let parts = self
            .heap
            .list(id)?
            .iter()
            .map(|element| self.format_value(*element))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("[{}]", parts.join(",")))
    }
}

fn bounds_checked(index: i64, len: usize) -> Result<usize, RuntimeError> {
    if index < 0 || index as usize >= len {
        return Err(RuntimeError::IndexError { index, len });
    }
    Ok(index as usize)
}

fn char_from_code(code: i64) -> Result<char, RuntimeError> {
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| RuntimeError::TypeError(format!("invalid character code: {}", code)))
}
