//! Intermediate representation for the shale shape analyzer
//!
//! A program is lowered (by an external front-end) into a [`Storage`]: a flat
//! table of types, variables and functions, where each function is a
//! control-flow graph of basic blocks over three-address-style instructions.
//! The analyzer never mutates a `Storage`; it only walks it.
//!
//! [`ProgramBuilder`] offers fluent in-memory construction, used by tests and
//! by tools that synthesize small programs directly.

pub mod builder;
pub mod cfg;
pub mod storage;
pub mod types;

pub use builder::{FncBuilder, ProgramBuilder};
pub use cfg::LoopEdges;
pub use storage::{
    Accessor, Binop, Block, BlockId, Fnc, FncId, Insn, InsnKind, Literal, Loc, Operand, Storage,
    Unop, Var, VarCode, VarId,
};
pub use types::{Type, TypeCode, TypeDb, TypeId, TypeItem};
