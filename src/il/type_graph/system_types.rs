use super::{PrimitiveType, TypeGraph, TypeId, TypeKind};
use crate::il::TypeFlags;

/// Types inside `System.*` that the verifier needs to reason about
///
/// Note: this isn't just a convenience - constants, `box`, `ldlen`, catch handlers, and filters all
/// produce values of one of these types.
pub struct SystemTypes<'g> {
    pub object: TypeId<'g>,
    pub value_type: TypeId<'g>,
    pub enum_type: TypeId<'g>,
    pub array: TypeId<'g>,
    pub string: TypeId<'g>,
    pub exception: TypeId<'g>,

    pub boolean: TypeId<'g>,
    pub char: TypeId<'g>,
    pub sbyte: TypeId<'g>,
    pub byte: TypeId<'g>,
    pub int16: TypeId<'g>,
    pub uint16: TypeId<'g>,
    pub int32: TypeId<'g>,
    pub uint32: TypeId<'g>,
    pub int64: TypeId<'g>,
    pub uint64: TypeId<'g>,
    pub intptr: TypeId<'g>,
    pub uintptr: TypeId<'g>,
    pub single: TypeId<'g>,
    pub double: TypeId<'g>,
}

impl<'g> SystemTypes<'g> {
    pub const OBJECT: &'static str = "System.Object";
    pub const VALUE_TYPE: &'static str = "System.ValueType";
    pub const ENUM: &'static str = "System.Enum";
    pub const ARRAY: &'static str = "System.Array";
    pub const STRING: &'static str = "System.String";
    pub const EXCEPTION: &'static str = "System.Exception";

    pub fn add_to_graph(graph: &TypeGraph<'g>) -> SystemTypes<'g> {
        let object = graph.add_type(Self::OBJECT, TypeKind::Class, None, TypeFlags::PUBLIC);
        let value_type = graph.add_class(
            Self::VALUE_TYPE,
            object,
            TypeFlags::PUBLIC | TypeFlags::ABSTRACT,
        );
        let enum_type = graph.add_class(
            Self::ENUM,
            value_type,
            TypeFlags::PUBLIC | TypeFlags::ABSTRACT,
        );
        let array = graph.add_class(Self::ARRAY, object, TypeFlags::PUBLIC | TypeFlags::ABSTRACT);
        let string = graph.add_class(Self::STRING, object, TypeFlags::PUBLIC | TypeFlags::SEALED);
        let exception = graph.add_class(Self::EXCEPTION, object, TypeFlags::PUBLIC);

        let primitive = |name: &str, primitive: PrimitiveType| {
            graph.add_type(
                name,
                TypeKind::Primitive(primitive),
                Some(value_type),
                TypeFlags::PUBLIC | TypeFlags::SEALED,
            )
        };

        SystemTypes {
            object,
            value_type,
            enum_type,
            array,
            string,
            exception,
            boolean: primitive("System.Boolean", PrimitiveType::Boolean),
            char: primitive("System.Char", PrimitiveType::Char),
            sbyte: primitive("System.SByte", PrimitiveType::I8),
            byte: primitive("System.Byte", PrimitiveType::U8),
            int16: primitive("System.Int16", PrimitiveType::I16),
            uint16: primitive("System.UInt16", PrimitiveType::U16),
            int32: primitive("System.Int32", PrimitiveType::I32),
            uint32: primitive("System.UInt32", PrimitiveType::U32),
            int64: primitive("System.Int64", PrimitiveType::I64),
            uint64: primitive("System.UInt64", PrimitiveType::U64),
            intptr: primitive("System.IntPtr", PrimitiveType::IntPtr),
            uintptr: primitive("System.UIntPtr", PrimitiveType::UIntPtr),
            single: primitive("System.Single", PrimitiveType::F32),
            double: primitive("System.Double", PrimitiveType::F64),
        }
    }

    /// Type corresponding to a primitive
    pub fn primitive(&self, primitive: PrimitiveType) -> TypeId<'g> {
        match primitive {
            PrimitiveType::Boolean => self.boolean,
            PrimitiveType::Char => self.char,
            PrimitiveType::I8 => self.sbyte,
            PrimitiveType::U8 => self.byte,
            PrimitiveType::I16 => self.int16,
            PrimitiveType::U16 => self.uint16,
            PrimitiveType::I32 => self.int32,
            PrimitiveType::U32 => self.uint32,
            PrimitiveType::I64 => self.int64,
            PrimitiveType::U64 => self.uint64,
            PrimitiveType::IntPtr => self.intptr,
            PrimitiveType::UIntPtr => self.uintptr,
            PrimitiveType::F32 => self.single,
            PrimitiveType::F64 => self.double,
        }
    }
}
