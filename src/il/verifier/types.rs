use crate::il::type_graph::{Assignable, PrimitiveType, TypeId, TypeKind};
use std::fmt;

/// Type of one slot on the operand stack
///
/// Primitives and enums keep their declared type even though the VM only distinguishes a handful
/// of [`StackClass`]es. This is what makes it possible to pick between the signed and unsigned
/// variants of instructions like `div` or `clt` just by looking at the stack.
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub enum TypeTag<'g> {
    /// The `null` reference (assignable to every reference type)
    Null,

    /// Value of the given type (for reference types, this is an object reference)
    Value(TypeId<'g>),

    /// Managed address of a location holding a value of the given type
    Address(TypeId<'g>),
}

/// Coarse classification of stack slots
///
/// These are the only distinctions the VM itself makes between stack values.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum StackClass {
    Int32,
    Int64,
    NativeInt,
    Float,
    Object,
    ValueType,
    Address,
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Signedness {
    Signed,
    Unsigned,
}

impl PrimitiveType {
    pub fn stack_class(self) -> StackClass {
        match self {
            PrimitiveType::Boolean
            | PrimitiveType::Char
            | PrimitiveType::I8
            | PrimitiveType::U8
            | PrimitiveType::I16
            | PrimitiveType::U16
            | PrimitiveType::I32
            | PrimitiveType::U32 => StackClass::Int32,
            PrimitiveType::I64 | PrimitiveType::U64 => StackClass::Int64,
            PrimitiveType::IntPtr | PrimitiveType::UIntPtr => StackClass::NativeInt,
            PrimitiveType::F32 | PrimitiveType::F64 => StackClass::Float,
        }
    }
}

impl<'g> TypeTag<'g> {
    /// Tag for a value of the given declared type (by-ref types become addresses)
    pub fn of(ty: TypeId<'g>) -> TypeTag<'g> {
        match ty.kind {
            TypeKind::ByRef(referent) => TypeTag::Address(referent),
            _ => TypeTag::Value(ty),
        }
    }

    pub fn stack_class(&self) -> StackClass {
        match self {
            TypeTag::Null => StackClass::Object,
            TypeTag::Address(_) => StackClass::Address,
            TypeTag::Value(ty) => match ty.kind {
                TypeKind::Primitive(p) | TypeKind::Enum(p) => p.stack_class(),
                TypeKind::ValueType => StackClass::ValueType,
                TypeKind::Class | TypeKind::Interface | TypeKind::Array(_) => StackClass::Object,
                TypeKind::ByRef(_) => StackClass::Address,
            },
        }
    }

    /// Is this an object reference (or `null`)?
    pub fn is_reference(&self) -> bool {
        self.stack_class() == StackClass::Object
    }

    /// Whether this type selects the signed or unsigned variant of an instruction
    ///
    /// Only integers (and enums over them) have a signedness. Floats count as signed: the only
    /// "unsigned" float instructions (eg. `cgt.un`) are about unordered comparisons.
    pub fn signedness(&self) -> Option<Signedness> {
        let primitive = match self {
            TypeTag::Value(ty) => ty.primitive()?,
            _ => return None,
        };
        if primitive.is_unsigned() {
            Some(Signedness::Unsigned)
        } else {
            Some(Signedness::Signed)
        }
    }

    /// Declared type behind the tag, if there is one
    pub fn type_id(&self) -> Option<TypeId<'g>> {
        match self {
            TypeTag::Null => None,
            TypeTag::Value(ty) | TypeTag::Address(ty) => Some(*ty),
        }
    }

    /// Can a slot of this type be used where `expected` is required?
    ///
    /// Primitives are interchangeable with other primitives in the same stack class (an `int16` is
    /// an `int32` on the stack), references follow the type graph, and everything else must match
    /// exactly.
    pub fn is_assignable(&self, expected: &TypeTag<'g>) -> bool {
        match (self, expected) {
            (TypeTag::Null, TypeTag::Null) => true,
            (TypeTag::Null, TypeTag::Value(ty)) => ty.is_reference(),
            (TypeTag::Value(found), TypeTag::Value(expected)) => {
                if found == expected {
                    return true;
                }
                match (found.primitive(), expected.primitive()) {
                    (Some(p1), Some(p2)) => p1.stack_class() == p2.stack_class(),
                    _ => found.is_reference() && found.is_assignable(expected),
                }
            }
            (TypeTag::Address(found), TypeTag::Address(expected)) => {
                is_referent_compatible(*found, *expected)
            }
            _ => false,
        }
    }

    /// Name used in diagnostics
    pub fn name(&self) -> String {
        match self {
            TypeTag::Null => String::from("null"),
            TypeTag::Value(ty) => ty.name.clone(),
            TypeTag::Address(ty) => format!("{}&", ty.name),
        }
    }
}

/// Can an address of `found` be used as an address of `expected`?
///
/// Addresses are invariant, except that primitives of the same size class can alias each other
/// (eg. an `int32&` can be read with `ldind.u4`).
pub fn is_referent_compatible<'g>(found: TypeId<'g>, expected: TypeId<'g>) -> bool {
    if found == expected {
        return true;
    }
    match (found.primitive(), expected.primitive()) {
        (Some(p1), Some(p2)) => p1.stack_class() == p2.stack_class(),
        _ => false,
    }
}

impl<'g> fmt::Debug for TypeTag<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl<'g> fmt::Display for TypeTag<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
