mod builtins;
mod bytecode;
mod config;
mod error;
mod heap;
mod loader;
mod types;
mod value;
mod vm;

pub use self::{
    builtins::*, bytecode::*, config::*, error::*, heap::*, loader::*, types::*, value::*, vm::*,
};
