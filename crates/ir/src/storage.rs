//! Program storage: variables, functions, basic blocks, instructions
//!
//! The shape of the tables follows what the analyzer needs to ask: which
//! variables exist and in which scope, which blocks a function has, which
//! blocks an instruction can branch to, and where an instruction came from
//! in the source (for error reports).

use crate::types::{TypeDb, TypeId};
use serde::{Deserialize, Serialize};

/// Index of a variable in [`Storage::vars`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Index of a function in [`Storage::fncs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FncId(pub u32);

/// Function-local index of a basic block in [`Fnc::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Storage class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarCode {
    /// Global scope, alive for the whole program, zero-initialized.
    Gl,
    /// Local to one function's stack frame, initially uninitialized.
    Lc(FncId),
}

/// Source location attached to instructions and variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub file: Option<String>,
    /// 1-indexed source line; zero when unknown.
    pub line: u32,
}

impl Loc {
    pub fn line(line: u32) -> Self {
        Loc { file: None, line }
    }
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file, self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// A program variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub code: VarCode,
    pub ty: TypeId,
    pub loc: Option<Loc>,
}

/// A literal operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Bool(bool),
    /// The null pointer.
    Null,
    Str(String),
    Fnc(FncId),
}

/// One step of an operand's accessor chain, applied left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accessor {
    /// Follow the pointer stored at the current location.
    Deref,
    /// Move to a member at a byte offset within the current object.
    Item { offset: u32, ty: TypeId },
    /// Take the address of the current location; must come last.
    Ref,
}

/// An instruction operand: a variable refined by accessors, or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Var {
        var: VarId,
        accessors: Vec<Accessor>,
        /// Type of the operand after applying all accessors.
        ty: TypeId,
    },
    Lit { value: Literal, ty: TypeId },
}

impl Operand {
    pub fn ty(&self) -> TypeId {
        match self {
            Operand::Var { ty, .. } | Operand::Lit { ty, .. } => *ty,
        }
    }
}

/// Sub-opcode of a unary instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unop {
    Assign,
    Not,
}

/// Sub-opcode of a binary instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binop {
    CmpEq,
    CmpNe,
    Add,
    Sub,
}

/// Instruction payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InsnKind {
    Unop {
        code: Unop,
        dst: Operand,
        src: Operand,
    },
    Binop {
        code: Binop,
        dst: Operand,
        src1: Operand,
        src2: Operand,
    },
    Call {
        dst: Option<Operand>,
        fnc: FncId,
        args: Vec<Operand>,
    },
    Cond {
        src: Operand,
        then_target: BlockId,
        else_target: BlockId,
    },
    Jmp {
        target: BlockId,
    },
    Ret {
        src: Option<Operand>,
    },
    Label {
        name: String,
    },
    Abort,
}

impl InsnKind {
    /// True for instructions that end a basic block.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InsnKind::Cond { .. } | InsnKind::Jmp { .. } | InsnKind::Ret { .. } | InsnKind::Abort
        )
    }

    /// Blocks this instruction can branch to.
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            InsnKind::Cond {
                then_target,
                else_target,
                ..
            } => vec![*then_target, *else_target],
            InsnKind::Jmp { target } => vec![*target],
            _ => Vec::new(),
        }
    }
}

/// An instruction with its source location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insn {
    pub kind: InsnKind,
    pub loc: Loc,
}

/// A basic block: a non-empty instruction list ending in a terminal insn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insns: Vec<Insn>,
    /// Blocks with an edge into this one; filled in by the builder.
    pub inbound: Vec<BlockId>,
}

impl Block {
    pub fn front(&self) -> Option<&Insn> {
        self.insns.first()
    }

    pub fn back(&self) -> Option<&Insn> {
        self.insns.last()
    }

    pub fn targets(&self) -> Vec<BlockId> {
        self.back().map(|i| i.kind.targets()).unwrap_or_default()
    }
}

/// A function: defined (with blocks) or extern (builtin, no body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fnc {
    pub name: String,
    pub ret_ty: TypeId,
    pub params: Vec<VarId>,
    pub entry: Option<BlockId>,
    pub blocks: Vec<Block>,
}

impl Fnc {
    pub fn is_defined(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }
}

/// The immutable program handed to the analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Storage {
    pub types: TypeDb,
    pub vars: Vec<Var>,
    pub fncs: Vec<Fnc>,
}

impl Storage {
    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }

    pub fn fnc(&self, id: FncId) -> &Fnc {
        &self.fncs[id.0 as usize]
    }

    pub fn fnc_by_name(&self, name: &str) -> Option<FncId> {
        self.fncs
            .iter()
            .position(|f| f.name == name)
            .map(|i| FncId(i as u32))
    }

    /// Variables local to `fnc`, in declaration order.
    pub fn locals_of(&self, fnc: FncId) -> impl Iterator<Item = VarId> + '_ {
        self.vars
            .iter()
            .enumerate()
            .filter(move |(_, v)| v.code == VarCode::Lc(fnc))
            .map(|(i, _)| VarId(i as u32))
    }

    /// Global variables, in declaration order.
    pub fn globals(&self) -> impl Iterator<Item = VarId> + '_ {
        self.vars
            .iter()
            .enumerate()
            .filter(|(_, v)| v.code == VarCode::Gl)
            .map(|(i, _)| VarId(i as u32))
    }
}
