//! Fluent construction of [`Storage`] values
//!
//! Front-ends and tests assemble programs through [`ProgramBuilder`] instead
//! of filling the tables by hand; the builder keeps operand types consistent
//! with the type table and computes inbound edges when a function is
//! finished.

use crate::storage::{
    Accessor, Binop, Block, BlockId, Fnc, FncId, Insn, InsnKind, Literal, Loc, Operand, Storage,
    Unop, Var, VarCode, VarId,
};
use crate::types::{TypeCode, TypeDb, TypeId};

/// Builder over a whole program.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    storage: Storage,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    pub fn types(&mut self) -> &mut TypeDb {
        &mut self.storage.types
    }

    pub fn global(&mut self, name: &str, ty: TypeId) -> VarId {
        let id = VarId(self.storage.vars.len() as u32);
        self.storage.vars.push(Var {
            name: name.to_string(),
            code: VarCode::Gl,
            ty,
            loc: None,
        });
        id
    }

    /// Declare a function without a body (a builtin such as `malloc`).
    pub fn extern_fnc(&mut self, name: &str, ret_ty: TypeId) -> FncId {
        let id = FncId(self.storage.fncs.len() as u32);
        self.storage.fncs.push(Fnc {
            name: name.to_string(),
            ret_ty,
            params: Vec::new(),
            entry: None,
            blocks: Vec::new(),
        });
        id
    }

    /// Start defining a function; finish with [`FncBuilder::finish`].
    pub fn fnc(&mut self, name: &str, ret_ty: TypeId) -> FncBuilder<'_> {
        let id = self.extern_fnc(name, ret_ty);
        FncBuilder {
            pb: self,
            id,
            cur: None,
            loc: Loc::default(),
        }
    }

    pub fn build(self) -> Storage {
        self.storage
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// Builder over one function's blocks and instructions.
#[derive(Debug)]
pub struct FncBuilder<'a> {
    pb: &'a mut ProgramBuilder,
    id: FncId,
    cur: Option<BlockId>,
    loc: Loc,
}

impl<'a> FncBuilder<'a> {
    pub fn id(&self) -> FncId {
        self.id
    }

    pub fn local(&mut self, name: &str, ty: TypeId) -> VarId {
        let id = VarId(self.pb.storage.vars.len() as u32);
        self.pb.storage.vars.push(Var {
            name: name.to_string(),
            code: VarCode::Lc(self.id),
            ty,
            loc: None,
        });
        id
    }

    pub fn param(&mut self, name: &str, ty: TypeId) -> VarId {
        let v = self.local(name, ty);
        self.fnc_mut().params.push(v);
        v
    }

    /// Create an empty block and make it current.
    pub fn block(&mut self, name: &str) -> BlockId {
        let fnc = self.fnc_mut();
        let id = BlockId(fnc.blocks.len() as u32);
        fnc.blocks.push(Block {
            name: name.to_string(),
            insns: Vec::new(),
            inbound: Vec::new(),
        });
        if fnc.entry.is_none() {
            fnc.entry = Some(id);
        }
        self.cur = Some(id);
        id
    }

    /// Continue appending into an existing block.
    pub fn switch_to(&mut self, bb: BlockId) -> &mut Self {
        self.cur = Some(bb);
        self
    }

    /// Set the source line attached to subsequently emitted instructions.
    pub fn at(&mut self, line: u32) -> &mut Self {
        self.loc = Loc::line(line);
        self
    }

    // ---- operand helpers ----------------------------------------------

    pub fn op_var(&self, v: VarId) -> Operand {
        Operand::Var {
            var: v,
            accessors: Vec::new(),
            ty: self.pb.storage.var(v).ty,
        }
    }

    /// `*v`
    pub fn op_deref(&self, v: VarId) -> Operand {
        let ty = self.pointee_of(self.pb.storage.var(v).ty);
        Operand::Var {
            var: v,
            accessors: vec![Accessor::Deref],
            ty,
        }
    }

    /// `v->member` at a byte offset within the pointee.
    pub fn op_field(&self, v: VarId, offset: u32) -> Operand {
        let pointee = self.pointee_of(self.pb.storage.var(v).ty);
        let ty = self
            .pb
            .storage
            .types
            .get(pointee)
            .item_at(offset)
            .map(|it| it.ty)
            .unwrap_or(pointee);
        Operand::Var {
            var: v,
            accessors: vec![Accessor::Deref, Accessor::Item { offset, ty }],
            ty,
        }
    }

    /// `&v`
    pub fn op_ref(&mut self, v: VarId) -> Operand {
        let ty = self.pb.storage.var(v).ty;
        let ptr = self.pb.storage.types.ptr(ty);
        Operand::Var {
            var: v,
            accessors: vec![Accessor::Ref],
            ty: ptr,
        }
    }

    pub fn op_int(&mut self, value: i64) -> Operand {
        let ty = self.pb.storage.types.int(8);
        Operand::Lit {
            value: Literal::Int(value),
            ty,
        }
    }

    pub fn op_null(&mut self) -> Operand {
        let void = self.pb.storage.types.void();
        let ty = self.pb.storage.types.ptr(void);
        Operand::Lit {
            value: Literal::Null,
            ty,
        }
    }

    // ---- instruction emitters -----------------------------------------

    pub fn assign(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.push(InsnKind::Unop {
            code: Unop::Assign,
            dst,
            src,
        })
    }

    pub fn not(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.push(InsnKind::Unop {
            code: Unop::Not,
            dst,
            src,
        })
    }

    pub fn binop(&mut self, code: Binop, dst: Operand, src1: Operand, src2: Operand) -> &mut Self {
        self.push(InsnKind::Binop {
            code,
            dst,
            src1,
            src2,
        })
    }

    pub fn call(&mut self, dst: Option<Operand>, fnc: FncId, args: Vec<Operand>) -> &mut Self {
        self.push(InsnKind::Call { dst, fnc, args })
    }

    pub fn cond(&mut self, src: Operand, then_target: BlockId, else_target: BlockId) -> &mut Self {
        self.push(InsnKind::Cond {
            src,
            then_target,
            else_target,
        })
    }

    pub fn jmp(&mut self, target: BlockId) -> &mut Self {
        self.push(InsnKind::Jmp { target })
    }

    pub fn ret(&mut self, src: Option<Operand>) -> &mut Self {
        self.push(InsnKind::Ret { src })
    }

    pub fn abort(&mut self) -> &mut Self {
        self.push(InsnKind::Abort)
    }

    /// Compute inbound edges and return the function id.
    pub fn finish(self) -> FncId {
        let id = self.id;
        let fnc = &mut self.pb.storage.fncs[id.0 as usize];
        let mut inbound: Vec<Vec<BlockId>> = vec![Vec::new(); fnc.blocks.len()];
        for (i, bb) in fnc.blocks.iter().enumerate() {
            for tgt in bb.targets() {
                let edges = &mut inbound[tgt.0 as usize];
                if !edges.contains(&BlockId(i as u32)) {
                    edges.push(BlockId(i as u32));
                }
            }
        }
        for (bb, edges) in fnc.blocks.iter_mut().zip(inbound) {
            bb.inbound = edges;
        }
        id
    }

    fn push(&mut self, kind: InsnKind) -> &mut Self {
        let bb = self
            .cur
            .expect("FncBuilder: emit before any block was created");
        let loc = self.loc.clone();
        self.fnc_mut().blocks[bb.0 as usize]
            .insns
            .push(Insn { kind, loc });
        self
    }

    fn fnc_mut(&mut self) -> &mut Fnc {
        &mut self.pb.storage.fncs[self.id.0 as usize]
    }

    fn pointee_of(&self, ty: TypeId) -> TypeId {
        let t = self.pb.storage.types.get(ty);
        if t.code == TypeCode::Ptr {
            if let Some(item) = t.items.first() {
                return item.ty;
            }
        }
        ty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_two_block_function_with_inbound_edges() {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let i64t = p.types().int(8);

        let mut f = p.fnc("main", void);
        let x = f.local("x", i64t);
        let b0 = f.block("entry");
        let b1 = f.block("exit");

        f.switch_to(b0).at(1);
        let op_x = f.op_var(x);
        let zero = f.op_int(0);
        f.assign(op_x, zero).jmp(b1);

        f.switch_to(b1).at(2).ret(None);
        let id = f.finish();

        let stor = p.build();
        let fnc = stor.fnc(id);
        assert!(fnc.is_defined());
        assert_eq!(fnc.entry, Some(BlockId(0)));
        assert_eq!(fnc.block(BlockId(1)).inbound, vec![BlockId(0)]);
        assert!(fnc.block(BlockId(0)).inbound.is_empty());
    }

    #[test]
    fn field_operand_resolves_member_type() {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let i64t = p.types().int(8);
        let node_fwd = p.types().strukt(vec![]);
        let fwd_ptr = p.types().ptr(node_fwd);
        let node = p.types().strukt(vec![
            crate::types::TypeItem {
                name: Some("next".into()),
                ty: fwd_ptr,
                offset: 0,
            },
            crate::types::TypeItem {
                name: Some("data".into()),
                ty: i64t,
                offset: 8,
            },
        ]);
        let node_ptr = p.types().ptr(node);

        let mut f = p.fnc("f", void);
        let n = f.local("n", node_ptr);
        f.block("entry");

        let next = f.op_field(n, 0);
        let data = f.op_field(n, 8);
        f.ret(None);
        f.finish();

        assert_eq!(next.ty(), fwd_ptr);
        assert_eq!(data.ty(), i64t);
    }
}
