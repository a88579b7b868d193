use crate::error::RuntimeError;
use std::collections::HashMap;

/// Declared kind of an instance field, used only to pick the zero value
/// `NEW` writes before any assignment. Reference-kind and untyped fields
/// start as `Null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    Str,
    Any,
}

impl FieldKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FieldKind::Int),
            1 => Some(FieldKind::Float),
            2 => Some(FieldKind::Bool),
            3 => Some(FieldKind::Str),
            4 => Some(FieldKind::Any),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FieldKind::Int => 0,
            FieldKind::Float => 1,
            FieldKind::Bool => 2,
            FieldKind::Str => 3,
            FieldKind::Any => 4,
        }
    }
}

/// One DEFINE_TYPE entry as it appears in a program image: the type's
/// own declarations, before inheritance flattening.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRecord {
    pub name: String,
    pub parent: Option<String>,
    pub fields: Vec<(String, FieldKind)>,
    pub methods: Vec<(String, u32)>,
}

/// A registered type with inheritance already resolved: `fields` holds
/// inherited fields first in declaration order, and `methods` is the
/// flattened lookup table (own definitions shadow inherited ones).
/// Dispatch is a single map lookup; the chain is never re-walked.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub parent: Option<u32>,
    pub fields: Vec<(String, FieldKind)>,
    pub methods: HashMap<String, u32>,
}

impl TypeDescriptor {
    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(field, _)| field == name)
    }
}

/// Registry of user-defined types, built from DEFINE_TYPE entries at
/// load time and immutable while the program runs.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeDescriptor>,
    by_name: HashMap<String, u32>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one type. Parents must already be registered, which also
    /// keeps every inheritance chain finite: a type can never name
    /// itself or a later type as its parent.
    pub fn register(&mut self, record: &TypeRecord) -> Result<u32, RuntimeError> {
        if self.by_name.contains_key(&record.name) {
            return Err(RuntimeError::TypeError(format!(
                "type already defined: {}",
                record.name
            )));
        }

        let (parent, mut fields, mut methods) = match &record.parent {
            Some(parent_name) => {
                if *parent_name == record.name {
                    return Err(RuntimeError::TypeError(format!(
                        "inheritance cycle: {} extends itself",
                        record.name
                    )));
                }
                let parent_id = *self.by_name.get(parent_name).ok_or_else(|| {
                    RuntimeError::TypeError(format!(
                        "unknown parent type: {} extends {}",
                        record.name, parent_name
                    ))
                })?;
                let parent = &self.types[parent_id as usize];
                (Some(parent_id), parent.fields.clone(), parent.methods.clone())
            }
            None => (None, Vec::new(), HashMap::new()),
        };

        for (name, kind) in &record.fields {
            if fields.iter().any(|(field, _)| field == name) {
                return Err(RuntimeError::TypeError(format!(
                    "field {} of type {} re-declares an inherited field",
                    name, record.name
                )));
            }
            fields.push((name.clone(), *kind));
        }

        for (name, function_index) in &record.methods {
            methods.insert(name.clone(), *function_index);
        }

        let id = self.types.len() as u32;
        self.types.push(TypeDescriptor {
            name: record.name.clone(),
            parent,
            fields,
            methods,
        });
        self.by_name.insert(record.name.clone(), id);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<&TypeDescriptor, RuntimeError> {
        self.types
            .get(id as usize)
            .ok_or_else(|| RuntimeError::TypeError(format!("unknown type id: {}", id)))
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn resolve_method(&self, type_id: u32, name: &str) -> Result<u32, RuntimeError> {
        let descriptor = self.get(type_id)?;
        descriptor.methods.get(name).copied().ok_or_else(|| {
            RuntimeError::MethodNotFound(format!("{} on {}", name, descriptor.name))
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
