//! The SYSCALL table and the OBJCALL built-in method table.
//!
//! Syscalls are the program's only door to the host: process exit,
//! console and file I/O, and reflection. Built-in methods are the
//! native operations on strings and lists that OBJCALL dispatches by
//! numeric id; OBJCALL on a user-defined instance instead resolves a
//! method name through the type table and runs ordinary bytecode.

use crate::error::RuntimeError;
use crate::heap::{HeapId, HeapObject};
use crate::value::Value;
use crate::vm::VirtualMachine;
use std::fs;
use std::io::Write;
use tracing::trace;

pub const SYS_EXIT: i64 = 0;
pub const SYS_PRINT: i64 = 1;
pub const SYS_INPUT: i64 = 2;
pub const SYS_GETF: i64 = 3;
pub const SYS_TYPE: i64 = 4;
pub const SYS_SCAN: i64 = 5;
pub const SYS_READ: i64 = 6;
pub const SYS_WRITE: i64 = 7;

pub const METHOD_APPEND: i64 = 0;
pub const METHOD_SIZE: i64 = 1;
pub const METHOD_REMOVE_AT: i64 = 2;
pub const METHOD_POP: i64 = 3;
pub const METHOD_IS_EMPTY: i64 = 4;
pub const METHOD_SLICE: i64 = 5;
pub const METHOD_MAP: i64 = 6;
pub const METHOD_FILTER: i64 = 7;
pub const METHOD_MIN: i64 = 8;
pub const METHOD_MAX: i64 = 9;
pub const METHOD_LOWER: i64 = 10;
pub const METHOD_UPPER: i64 = 11;
pub const METHOD_TO_STRING: i64 = 12;

fn method_name(id: i64) -> &'static str {
    match id {
        METHOD_APPEND => "append",
        METHOD_SIZE => "size",
        METHOD_REMOVE_AT => "remove_at",
        METHOD_POP => "pop",
        METHOD_IS_EMPTY => "is_empty",
        METHOD_SLICE => "slice",
        METHOD_MAP => "map",
        METHOD_FILTER => "filter",
        METHOD_MIN => "min",
        METHOD_MAX => "max",
        METHOD_LOWER => "lower",
        METHOD_UPPER => "upper",
        METHOD_TO_STRING => "toString",
        _ => "?",
    }
}

impl VirtualMachine {
    pub(crate) fn syscall(&mut self, id: i64) -> Result<(), RuntimeError> {
        trace!(id, "syscall");
        match id {
            SYS_EXIT => {
                let status = self.pop_int("exit")?;
                self.exit_status = Some(status);
                Ok(())
            }
            SYS_PRINT => {
                let value = self.pop()?;
                let text = self.format_value(value)?;
                writeln!(self.stdout, "{}", text)?;
                self.stdout.flush()?;
                Ok(())
            }
            SYS_INPUT => {
                let mut line = String::new();
                self.stdin.read_line(&mut line)?;
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                let id = self.heap.allocate_string(&line);
                self.push(Value::StringRef(id))
            }
            SYS_GETF => {
                let name = self.pop_string("getf")?;
                let object = self.pop()?;
                let slot = self.field_slot_of(object, &name)?;
                let id = object.heap_id().unwrap_or_default();
                let value = self.heap.instance(id)?.fields[slot];
                self.push(value)
            }
            SYS_TYPE => {
                let value = self.pop()?;
                let text = match value {
                    Value::ObjectRef(id) => {
                        let type_id = self.heap.instance(id)?.type_id;
                        self.type_name(type_id)?.to_string()
                    }
                    other => other.kind_name().to_string(),
                };
                let id = self.heap.allocate_string(&text);
                self.push(Value::StringRef(id))
            }
            SYS_SCAN => {
                let token = self.read_token()?;
                let id = self.heap.allocate_string(&token);
                self.push(Value::StringRef(id))
            }
            SYS_READ => {
                let path = self.pop_string("read")?;
                let contents = fs::read_to_string(&path)?;
                let id = self.heap.allocate_string(&contents);
                self.push(Value::StringRef(id))
            }
            SYS_WRITE => {
                let path = self.pop_string("write")?;
                let contents = self.pop_string("write")?;
                fs::write(&path, contents)?;
                self.push(Value::Null)
            }
            _ => Err(RuntimeError::TypeError(format!("unknown syscall: {}", id))),
        }
    }

    /// One whitespace-delimited token; an empty string at end of input.
    /// Bytes are accumulated raw and decoded once, so multi-byte UTF-8
    /// sequences pass through intact (their bytes never match ASCII
    /// whitespace).
    fn read_token(&mut self) -> Result<String, RuntimeError> {
        let mut token = Vec::new();
        loop {
            let buffer = self.stdin.fill_buf()?;
            if buffer.is_empty() {
                break;
            }
            let mut consumed = 0;
            let mut done = false;
            for &byte in buffer {
                if byte.is_ascii_whitespace() {
                    consumed += 1;
                    if !token.is_empty() {
                        done = true;
                        break;
                    }
                } else {
                    token.push(byte);
                    consumed += 1;
                }
            }
            self.stdin.consume(consumed);
            if done {
                break;
            }
        }
        String::from_utf8(token)
            .map_err(|_| RuntimeError::IoError("invalid utf-8 in input".into()))
    }

    fn pop_string(&mut self, context: &str) -> Result<String, RuntimeError> {
        match self.pop()? {
            Value::StringRef(id) => Ok(self.heap.string(id)?.iter().collect()),
            other => Err(RuntimeError::TypeError(format!(
                "{} requires a string, found {}",
                context,
                other.kind_name()
            ))),
        }
    }

    // ---- OBJCALL: built-in methods -------------------------------------

    pub(crate) fn call_builtin_method(
        &mut self,
        receiver: Value,
        id: i64,
    ) -> Result<(), RuntimeError> {
        match id {
            METHOD_SIZE | METHOD_IS_EMPTY | METHOD_SLICE | METHOD_TO_STRING => {
                self.shared_method(receiver, id)
            }
            METHOD_APPEND | METHOD_REMOVE_AT | METHOD_POP | METHOD_MAP | METHOD_FILTER
            | METHOD_MIN | METHOD_MAX => match receiver {
                Value::ListRef(list) => self.list_method(list, id),
                other => Err(RuntimeError::TypeError(format!(
                    "{} is defined only for lists, found {}",
                    method_name(id),
                    other.kind_name()
                ))),
            },
            METHOD_LOWER | METHOD_UPPER => match receiver {
                Value::StringRef(string) => self.string_case(string, id),
                other => Err(RuntimeError::TypeError(format!(
                    "{} is defined only for strings, found {}",
                    method_name(id),
                    other.kind_name()
                ))),
            },
            _ => Err(RuntimeError::TypeError(format!(
                "unknown builtin method id: {}",
                id
            ))),
        }
    }

    fn shared_method(&mut self, receiver: Value, id: i64) -> Result<(), RuntimeError> {
        let len = match receiver {
            Value::ListRef(list) => self.heap.list(list)?.len(),
            Value::StringRef(string) => self.heap.string(string)?.len(),
            other => {
                return Err(RuntimeError::TypeError(format!(
                    "{} requires a list or string, found {}",
                    method_name(id),
                    other.kind_name()
                )))
            }
        };
        match id {
            METHOD_SIZE => self.push(Value::Int(len as i64)),
            METHOD_IS_EMPTY => self.push(Value::Bool(len == 0)),
            METHOD_SLICE => {
                let to = self.pop_int("slice")?;
                let from = self.pop_int("slice")?;
                let (from, to) = slice_bounds(from, to, len)?;
                match receiver {
                    Value::ListRef(list) => {
                        let segment = self.heap.list(list)?[from..to].to_vec();
                        let new_id = self.heap.allocate(HeapObject::List(segment));
                        self.push(Value::ListRef(new_id))
                    }
                    _ => {
                        let string = receiver.heap_id().unwrap_or_default();
                        let segment: String =
                            self.heap.string(string)?[from..to].iter().collect();
                        let new_id = self.heap.allocate_string(&segment);
                        self.push(Value::StringRef(new_id))
                    }
                }
            }
            _ => {
                let text = self.format_value(receiver)?;
                let new_id = self.heap.allocate_string(&text);
                self.push(Value::StringRef(new_id))
            }
        }
    }

    fn list_method(&mut self, list: HeapId, id: i64) -> Result<(), RuntimeError> {
        match id {
            METHOD_APPEND => {
                let value = self.pop()?;
                self.heap.list_mut(list)?.push(value);
                Ok(())
            }
            METHOD_REMOVE_AT => {
                let index = self.pop_int("remove_at")?;
                let elements = self.heap.list_mut(list)?;
                if index < 0 || index as usize >= elements.len() {
                    return Err(RuntimeError::IndexError {
                        index,
                        len: elements.len(),
                    });
                }
                elements.remove(index as usize);
                Ok(())
            }
            METHOD_POP => {
                // Silently does nothing on an empty list.
                self.heap.list_mut(list)?.pop();
                Ok(())
            }
            METHOD_MAP | METHOD_FILTER => self.iterate(list, id),
            _ => self.extremum(list, id),
        }
    }

    /// map/filter over a snapshot of the elements. The receiver and the
    /// result list sit on the stack while callables run so a collection
    /// mid-iteration cannot reclaim either.
    fn iterate(&mut self, list: HeapId, id: i64) -> Result<(), RuntimeError> {
        let function_index = match self.pop()? {
            Value::Int(index) => index as u32,
            other => {
                return Err(RuntimeError::TypeError(format!(
                    "{} requires a callable, found {}",
                    method_name(id),
                    other.kind_name()
                )))
            }
        };
        let elements = self.heap.list(list)?.clone();
        let result = self.heap.allocate(HeapObject::List(Vec::new()));
        self.push(Value::ListRef(list))?;
        self.push(Value::ListRef(result))?;
        for element in elements {
            let value = self.invoke_callable(function_index, element)?;
            if self.exit_status.is_some() {
                return Ok(());
            }
            if id == METHOD_MAP {
                self.heap.list_mut(result)?.push(value);
            } else {
                match value {
                    Value::Bool(true) => self.heap.list_mut(result)?.push(element),
                    Value::Bool(false) => {}
                    other => {
                        return Err(RuntimeError::TypeError(format!(
                            "filter callable must return a bool, found {}",
                            other.kind_name()
                        )))
                    }
                }
            }
        }
        self.pop()?;
        self.pop()?;
        self.push(Value::ListRef(result))
    }

    fn extremum(&mut self, list: HeapId, id: i64) -> Result<(), RuntimeError> {
        let elements = self.heap.list(list)?.clone();
        if elements.is_empty() {
            return Err(RuntimeError::IndexError { index: 0, len: 0 });
        }
        let mut best = elements[0];
        let mut best_key = numeric_key(best, id)?;
        for &element in &elements[1..] {
            let key = numeric_key(element, id)?;
            let better = if id == METHOD_MIN {
                key < best_key
            } else {
                key > best_key
            };
            if better {
                best = element;
                best_key = key;
            }
        }
        self.push(best)
    }

    fn string_case(&mut self, string: HeapId, id: i64) -> Result<(), RuntimeError> {
        let text: String = self.heap.string(string)?.iter().collect();
        let converted = if id == METHOD_LOWER {
            text.to_lowercase()
        } else {
            text.to_uppercase()
        };
        let new_id = self.heap.allocate_string(&converted);
        self.push(Value::StringRef(new_id))
    }

    // ---- OBJCALL: named instance methods -------------------------------

    /// Resolve `operand` (a constant-pool index holding the method name)
    /// against the receiver's type, rotate the receiver beneath the
    /// already-pushed arguments so it lands in parameter slot 0, and
    /// push a frame through the normal call protocol.
    pub(crate) fn call_instance_method(
        &mut self,
        receiver: HeapId,
        operand: i64,
    ) -> Result<(), RuntimeError> {
        let name = self.constant_str(operand)?;
        let type_id = self.heap.instance(receiver)?.type_id;
        let function_index = self.resolve_method(type_id, &name)?;
        let arity = self.function_arity(function_index)?;

        self.push(Value::ObjectRef(receiver))?;
        if self.stack_pointer < self.operand_floor() + arity {
            return Err(RuntimeError::StackUnderflow);
        }
        let start = self.stack_pointer - arity;
        self.stack[start..self.stack_pointer].rotate_right(1);
        self.call_function(function_index)
    }
}

fn slice_bounds(from: i64, to: i64, len: usize) -> Result<(usize, usize), RuntimeError> {
    if from < 0 || to < from || to as usize > len {
        return Err(RuntimeError::IndexError {
            index: if from < 0 { from } else { to },
            len,
        });
    }
    Ok((from as usize, to as usize))
}

fn numeric_key(value: Value, id: i64) -> Result<f64, RuntimeError> {
    if value.is_numeric() {
        Ok(value.as_f64())
    } else {
        Err(RuntimeError::TypeError(format!(
            "{} requires numeric elements, found {}",
            method_name(id),
            value.kind_name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Function, Instruction, Opcode, Program};
    use crate::types::{FieldKind, TypeRecord};
    use anyhow::Result;
    use std::cell::RefCell;
    use std::io::{self, Cursor};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn op(opcode: Opcode, operand: i64) -> Instruction {
        Instruction::new(opcode, operand)
    }

    fn function(name: &str, arity: usize, num_locals: usize, code: Vec<Instruction>) -> Function {
        Function {
            name: name.into(),
            arity,
            num_locals,
            handlers: Vec::new(),
            code,
        }
    }

    fn machine(constants: Vec<Constant>, functions: Vec<Function>) -> VirtualMachine {
        let program = Program {
            constants,
            types: Vec::new(),
            functions,
            entry: 0,
        };
        VirtualMachine::new(program).unwrap()
    }

    fn empty_machine() -> VirtualMachine {
        machine(Vec::new(), vec![function("main", 0, 0, Vec::new())])
    }

    fn string_of(vm: &VirtualMachine, value: Value) -> String {
        match value {
            Value::StringRef(id) => vm.heap.string(id).unwrap().iter().collect(),
            other => panic!("expected a string, found {:?}", other),
        }
    }

    #[test]
    fn print_writes_canonical_formatting() -> Result<()> {
        let mut vm = empty_machine();
        let sink = Sink::default();
        vm.set_output(Box::new(sink.clone()));

        vm.push(Value::Int(42))?;
        vm.syscall(SYS_PRINT)?;
        vm.push(Value::Bool(true))?;
        vm.syscall(SYS_PRINT)?;
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ]));
        vm.push(Value::ListRef(list))?;
        vm.syscall(SYS_PRINT)?;

        assert_eq!(sink.text(), "42\nTrue\n[1,2,3]\n");
        Ok(())
    }

    #[test]
    fn input_reads_one_line_without_newline() -> Result<()> {
        let mut vm = empty_machine();
        vm.set_input(Box::new(Cursor::new(b"first line\nrest".to_vec())));

        vm.syscall(SYS_INPUT)?;
        let value = vm.stack_top()?;
        assert_eq!(string_of(&vm, value), "first line");
        Ok(())
    }

    #[test]
    fn scan_reads_whitespace_delimited_tokens() -> Result<()> {
        let mut vm = empty_machine();
        vm.set_input(Box::new(Cursor::new(b"  alpha\n beta ".to_vec())));

        vm.syscall(SYS_SCAN)?;
        let first = vm.pop()?;
        assert_eq!(string_of(&vm, first), "alpha");
        vm.syscall(SYS_SCAN)?;
        let second = vm.pop()?;
        assert_eq!(string_of(&vm, second), "beta");
        // End of input yields an empty token.
        vm.syscall(SYS_SCAN)?;
        let third = vm.pop()?;
        assert_eq!(string_of(&vm, third), "");
        Ok(())
    }

    #[test]
    fn scan_keeps_multibyte_utf8_tokens_intact() -> Result<()> {
        let mut vm = empty_machine();
        vm.set_input(Box::new(Cursor::new("héllo wörld".as_bytes().to_vec())));

        vm.syscall(SYS_SCAN)?;
        let first = vm.pop()?;
        assert_eq!(string_of(&vm, first), "héllo");
        vm.syscall(SYS_SCAN)?;
        let second = vm.pop()?;
        assert_eq!(string_of(&vm, second), "wörld");
        Ok(())
    }

    #[test]
    fn exit_stops_the_program_with_its_status() {
        let mut vm = machine(
            vec![Constant::Int(7), Constant::Int(99)],
            vec![function(
                "main",
                0,
                0,
                vec![
                    op(Opcode::Store, 0),
                    op(Opcode::SysCall, SYS_EXIT),
                    // Never reached.
                    op(Opcode::Store, 1),
                ],
            )],
        );
        let status = vm.run().unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn type_syscall_names_kinds_and_instance_types() -> Result<()> {
        let program = Program {
            constants: Vec::new(),
            types: vec![TypeRecord {
                name: "Point".into(),
                parent: None,
                fields: vec![
                    ("x".into(), FieldKind::Int),
                    ("y".into(), FieldKind::Int),
                ],
                methods: Vec::new(),
            }],
            functions: vec![function("main", 0, 0, Vec::new())],
            entry: 0,
        };
        let mut vm = VirtualMachine::new(program).unwrap();

        vm.push(Value::Float(1.5))?;
        vm.syscall(SYS_TYPE)?;
        let kind = vm.pop()?;
        assert_eq!(string_of(&vm, kind), "float");

        let instance = vm.heap.allocate(HeapObject::Instance(crate::heap::Instance {
            type_id: 0,
            fields: vec![Value::Int(0), Value::Int(0)],
        }));
        vm.push(Value::ObjectRef(instance))?;
        vm.syscall(SYS_TYPE)?;
        let name = vm.pop()?;
        assert_eq!(string_of(&vm, name), "Point");
        Ok(())
    }

    #[test]
    fn getf_reads_fields_reflectively() -> Result<()> {
        let program = Program {
            constants: Vec::new(),
            types: vec![TypeRecord {
                name: "Point".into(),
                parent: None,
                fields: vec![
                    ("x".into(), FieldKind::Int),
                    ("y".into(), FieldKind::Int),
                ],
                methods: Vec::new(),
            }],
            functions: vec![function("main", 0, 0, Vec::new())],
            entry: 0,
        };
        let mut vm = VirtualMachine::new(program).unwrap();
        let instance = vm.heap.allocate(HeapObject::Instance(crate::heap::Instance {
            type_id: 0,
            fields: vec![Value::Int(3), Value::Int(4)],
        }));
        let name = vm.heap.allocate_string("y");

        vm.push(Value::ObjectRef(instance))?;
        vm.push(Value::StringRef(name))?;
        vm.syscall(SYS_GETF)?;
        assert_eq!(vm.stack_top()?, Value::Int(4));
        Ok(())
    }

    #[test]
    fn getf_unknown_field_is_field_not_found() -> Result<()> {
        let program = Program {
            constants: Vec::new(),
            types: vec![TypeRecord {
                name: "Point".into(),
                parent: None,
                fields: vec![("x".into(), FieldKind::Int)],
                methods: Vec::new(),
            }],
            functions: vec![function("main", 0, 0, Vec::new())],
            entry: 0,
        };
        let mut vm = VirtualMachine::new(program).unwrap();
        let instance = vm.heap.allocate(HeapObject::Instance(crate::heap::Instance {
            type_id: 0,
            fields: vec![Value::Int(0)],
        }));
        let name = vm.heap.allocate_string("z");

        vm.push(Value::ObjectRef(instance))?;
        vm.push(Value::StringRef(name))?;
        let result = vm.syscall(SYS_GETF);
        assert!(matches!(result, Err(RuntimeError::FieldNotFound(_))));
        Ok(())
    }

    #[test]
    fn file_write_then_read_round_trips() -> Result<()> {
        let path = std::env::temp_dir().join("rime_builtins_io_test.txt");
        let path_text = path.to_string_lossy().into_owned();
        let mut vm = empty_machine();

        let contents = vm.heap.allocate_string("stored by the vm\n");
        let path_string = vm.heap.allocate_string(&path_text);
        vm.push(Value::StringRef(contents))?;
        vm.push(Value::StringRef(path_string))?;
        vm.syscall(SYS_WRITE)?;
        assert_eq!(vm.pop()?, Value::Null);

        let path_string = vm.heap.allocate_string(&path_text);
        vm.push(Value::StringRef(path_string))?;
        vm.syscall(SYS_READ)?;
        let read_back = vm.pop()?;
        assert_eq!(string_of(&vm, read_back), "stored by the vm\n");

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn reading_a_missing_file_is_a_recoverable_io_error() -> Result<()> {
        let mut vm = empty_machine();
        let path = vm.heap.allocate_string("/no/such/directory/rime.txt");
        vm.push(Value::StringRef(path))?;
        let error = vm.syscall(SYS_READ).unwrap_err();
        assert!(matches!(error, RuntimeError::IoError(_)));
        assert!(error.is_recoverable());
        Ok(())
    }

    #[test]
    fn unknown_syscall_is_a_type_error() {
        let mut vm = empty_machine();
        assert!(matches!(
            vm.syscall(500),
            Err(RuntimeError::TypeError(_))
        ));
    }

    #[test]
    fn append_size_and_is_empty() -> Result<()> {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(Vec::new()));

        vm.call_builtin_method(Value::ListRef(list), METHOD_IS_EMPTY)?;
        assert_eq!(vm.pop()?, Value::Bool(true));

        vm.push(Value::Int(5))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_APPEND)?;
        vm.push(Value::Int(6))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_APPEND)?;

        vm.call_builtin_method(Value::ListRef(list), METHOD_SIZE)?;
        assert_eq!(vm.pop()?, Value::Int(2));
        assert_eq!(vm.heap.list(list)?, &vec![Value::Int(5), Value::Int(6)]);
        Ok(())
    }

    #[test]
    fn remove_at_shifts_and_checks_bounds() -> Result<()> {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ]));

        vm.push(Value::Int(1))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_REMOVE_AT)?;
        assert_eq!(vm.heap.list(list)?, &vec![Value::Int(1), Value::Int(3)]);

        vm.push(Value::Int(5))?;
        let result = vm.call_builtin_method(Value::ListRef(list), METHOD_REMOVE_AT);
        assert!(matches!(
            result,
            Err(RuntimeError::IndexError { index: 5, len: 2 })
        ));
        Ok(())
    }

    #[test]
    fn pop_on_an_empty_list_is_a_silent_noop() -> Result<()> {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(vec![Value::Int(9)]));

        vm.call_builtin_method(Value::ListRef(list), METHOD_POP)?;
        assert!(vm.heap.list(list)?.is_empty());
        vm.call_builtin_method(Value::ListRef(list), METHOD_POP)?;
        assert!(vm.heap.list(list)?.is_empty());
        Ok(())
    }

    #[test]
    fn slice_copies_a_list_segment() -> Result<()> {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(10),
            Value::Int(20),
            Value::Int(30),
            Value::Int(40),
        ]));

        vm.push(Value::Int(1))?;
        vm.push(Value::Int(3))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_SLICE)?;
        let segment = match vm.pop()? {
            Value::ListRef(id) => id,
            other => panic!("expected a list, found {:?}", other),
        };
        assert_eq!(
            vm.heap.list(segment)?,
            &vec![Value::Int(20), Value::Int(30)]
        );
        // The source is untouched.
        assert_eq!(vm.heap.list(list)?.len(), 4);
        Ok(())
    }

    #[test]
    fn slice_works_on_strings_and_checks_bounds() -> Result<()> {
        let mut vm = empty_machine();
        let string = vm.heap.allocate_string("rimestone");

        vm.push(Value::Int(0))?;
        vm.push(Value::Int(4))?;
        vm.call_builtin_method(Value::StringRef(string), METHOD_SLICE)?;
        let value = vm.pop()?;
        assert_eq!(string_of(&vm, value), "rime");

        vm.push(Value::Int(4))?;
        vm.push(Value::Int(99))?;
        let result = vm.call_builtin_method(Value::StringRef(string), METHOD_SLICE);
        assert!(matches!(result, Err(RuntimeError::IndexError { .. })));
        Ok(())
    }

    #[test]
    fn map_applies_a_callable_per_element() -> Result<()> {
        let mut vm = machine(
            Vec::new(),
            vec![
                function("main", 0, 0, Vec::new()),
                function(
                    "double",
                    1,
                    1,
                    vec![
                        op(Opcode::Load, 0),
                        op(Opcode::Load, 0),
                        op(Opcode::Add, 0),
                        op(Opcode::Return, 0),
                    ],
                ),
            ],
        );
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ]));

        vm.push(Value::Int(1))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_MAP)?;
        let result = match vm.pop()? {
            Value::ListRef(id) => id,
            other => panic!("expected a list, found {:?}", other),
        };
        assert_eq!(
            vm.heap.list(result)?,
            &vec![Value::Int(2), Value::Int(4), Value::Int(6)]
        );
        // map builds a fresh list.
        assert_eq!(vm.heap.list(list)?.len(), 3);
        Ok(())
    }

    #[test]
    fn filter_keeps_elements_the_callable_accepts() -> Result<()> {
        // is_odd(n) = n % 2 == 1
        let mut vm = machine(
            vec![Constant::Int(2), Constant::Int(1)],
            vec![
                function("main", 0, 0, Vec::new()),
                function(
                    "is_odd",
                    1,
                    1,
                    vec![
                        op(Opcode::Load, 0),
                        op(Opcode::Store, 0),
                        op(Opcode::Mod, 0),
                        op(Opcode::Store, 1),
                        op(Opcode::Eq, 0),
                        op(Opcode::Return, 0),
                    ],
                ),
            ],
        );
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
        ]));

        vm.push(Value::Int(1))?;
        vm.call_builtin_method(Value::ListRef(list), METHOD_FILTER)?;
        let result = match vm.pop()? {
            Value::ListRef(id) => id,
            other => panic!("expected a list, found {:?}", other),
        };
        assert_eq!(
            vm.heap.list(result)?,
            &vec![Value::Int(1), Value::Int(3)]
        );
        Ok(())
    }

    #[test]
    fn filter_rejects_non_bool_callables() -> Result<()> {
        // identity returns its argument unchanged, so filtering ints fails.
        let mut vm = machine(
            Vec::new(),
            vec![
                function("main", 0, 0, Vec::new()),
                function(
                    "identity",
                    1,
                    1,
                    vec![op(Opcode::Load, 0), op(Opcode::Return, 0)],
                ),
            ],
        );
        let list = vm.heap.allocate(HeapObject::List(vec![Value::Int(1)]));

        vm.push(Value::Int(1))?;
        let result = vm.call_builtin_method(Value::ListRef(list), METHOD_FILTER);
        assert!(matches!(result, Err(RuntimeError::TypeError(_))));
        Ok(())
    }

    #[test]
    fn min_and_max_over_mixed_numerics() -> Result<()> {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(3),
            Value::Float(2.5),
            Value::Int(7),
        ]));

        vm.call_builtin_method(Value::ListRef(list), METHOD_MIN)?;
        assert_eq!(vm.pop()?, Value::Float(2.5));
        vm.call_builtin_method(Value::ListRef(list), METHOD_MAX)?;
        assert_eq!(vm.pop()?, Value::Int(7));
        Ok(())
    }

    #[test]
    fn min_of_an_empty_list_is_an_index_error() {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(Vec::new()));
        let result = vm.call_builtin_method(Value::ListRef(list), METHOD_MIN);
        assert!(matches!(
            result,
            Err(RuntimeError::IndexError { index: 0, len: 0 })
        ));
    }

    #[test]
    fn max_rejects_non_numeric_elements() {
        let mut vm = empty_machine();
        let name = vm.heap.allocate_string("three");
        let list = vm
            .heap
            .allocate(HeapObject::List(vec![Value::Int(1), Value::StringRef(name)]));
        let result = vm.call_builtin_method(Value::ListRef(list), METHOD_MAX);
        assert!(matches!(result, Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn lower_and_upper_build_fresh_strings() -> Result<()> {
        let mut vm = empty_machine();
        let string = vm.heap.allocate_string("Rime VM");

        vm.call_builtin_method(Value::StringRef(string), METHOD_LOWER)?;
        let lowered = vm.pop()?;
        assert_eq!(string_of(&vm, lowered), "rime vm");

        vm.call_builtin_method(Value::StringRef(string), METHOD_UPPER)?;
        let raised = vm.pop()?;
        assert_eq!(string_of(&vm, raised), "RIME VM");

        // The receiver is untouched.
        assert_eq!(vm.heap.string(string)?.iter().collect::<String>(), "Rime VM");
        Ok(())
    }

    #[test]
    fn to_string_formats_lists() -> Result<()> {
        let mut vm = empty_machine();
        let inner = vm.heap.allocate_string("x");
        let list = vm.heap.allocate(HeapObject::List(vec![
            Value::Int(1),
            Value::StringRef(inner),
            Value::Bool(false),
        ]));

        vm.call_builtin_method(Value::ListRef(list), METHOD_TO_STRING)?;
        let text = vm.pop()?;
        assert_eq!(string_of(&vm, text), "[1,x,False]");
        Ok(())
    }

    #[test]
    fn list_only_methods_reject_strings() {
        let mut vm = empty_machine();
        let string = vm.heap.allocate_string("abc");
        let result = vm.call_builtin_method(Value::StringRef(string), METHOD_MAP);
        assert!(matches!(result, Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn string_only_methods_reject_lists() {
        let mut vm = empty_machine();
        let list = vm.heap.allocate(HeapObject::List(Vec::new()));
        let result = vm.call_builtin_method(Value::ListRef(list), METHOD_UPPER);
        assert!(matches!(result, Err(RuntimeError::TypeError(_))));
    }
}
