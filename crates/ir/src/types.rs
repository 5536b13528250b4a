//! Type table for analyzed programs
//!
//! Types are interned into a [`TypeDb`] and referenced by [`TypeId`]
//! everywhere else in the IR, so that equality is an id comparison and the
//! analyzer can hash and copy type references freely.

use serde::{Deserialize, Serialize};

/// Index of a type in its [`TypeDb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Coarse classification of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeCode {
    Void,
    Int,
    Bool,
    Ptr,
    Struct,
    Union,
    Array,
    String,
    Fnc,
    Unknown,
}

/// A named member of a composite type, placed at a byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeItem {
    pub name: Option<String>,
    pub ty: TypeId,
    pub offset: u32,
}

/// One entry of the type table.
///
/// `items` is the pointee for `Ptr`, the element type for `Array`, and the
/// member list for `Struct`/`Union`; empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type {
    pub code: TypeCode,
    /// Size in bytes; zero when not known (e.g. `Void`, opaque structs).
    pub size: u32,
    pub items: Vec<TypeItem>,
}

impl Type {
    /// Member item placed exactly at `offset`, if any.
    pub fn item_at(&self, offset: u32) -> Option<&TypeItem> {
        self.items.iter().find(|it| it.offset == offset)
    }
}

/// The interned type table of one program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeDb {
    types: Vec<Type>,
}

impl TypeDb {
    pub fn new() -> Self {
        TypeDb::default()
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u32), t))
    }

    /// Intern a type, returning the id of an existing structurally equal
    /// entry when there is one.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(pos) = self.types.iter().position(|t| *t == ty) {
            return TypeId(pos as u32);
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.leaf(TypeCode::Void, 0)
    }

    pub fn int(&mut self, size: u32) -> TypeId {
        self.leaf(TypeCode::Int, size)
    }

    pub fn bool(&mut self) -> TypeId {
        self.leaf(TypeCode::Bool, 1)
    }

    /// Pointer to `pointee`, of the conventional 8-byte width.
    pub fn ptr(&mut self, pointee: TypeId) -> TypeId {
        self.intern(Type {
            code: TypeCode::Ptr,
            size: 8,
            items: vec![TypeItem {
                name: None,
                ty: pointee,
                offset: 0,
            }],
        })
    }

    pub fn strukt(&mut self, members: Vec<TypeItem>) -> TypeId {
        let size = members
            .iter()
            .map(|m| m.offset + self.get(m.ty).size)
            .max()
            .unwrap_or(0);
        self.intern(Type {
            code: TypeCode::Struct,
            size,
            items: members,
        })
    }

    fn leaf(&mut self, code: TypeCode, size: u32) -> TypeId {
        self.intern(Type {
            code,
            size,
            items: Vec::new(),
        })
    }

    /// True for types whose values are stored as a block of sub-fields
    /// rather than a single scalar cell.
    pub fn is_composite(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).code,
            TypeCode::Struct | TypeCode::Union | TypeCode::Array
        )
    }

    /// True when some type in the table can reach memory: the analyzer may
    /// skip programs without pointers or composites entirely.
    pub fn any_complex(&self) -> bool {
        self.types.iter().any(|t| {
            matches!(
                t.code,
                TypeCode::Ptr
                    | TypeCode::Struct
                    | TypeCode::Union
                    | TypeCode::Array
                    | TypeCode::String
            )
        })
    }
}
