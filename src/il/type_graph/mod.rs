//! Types and members that emitted code can refer to
//!
//! The emitter never needs full metadata: for any type, field, or method it only wants to know the
//! handful of facts that drive stack effects (is this a value type? what are the parameter types?
//! is the method static or virtual?). [`TypeGraph`] is a small in-memory model of exactly that,
//! backed by arenas so that handles into it ([`TypeId`], [`FieldId`], [`MethodId`]) are `Copy`
//! and compare by identity.

use super::{FieldFlags, MethodFlags, TypeFlags};
use crate::util::RefId;
use elsa::map::FrozenMap;
use elsa::FrozenVec;
use std::cell::Cell;
use std::fmt;
use typed_arena::Arena;

mod assignable;
mod resolver;
mod system_types;

pub use assignable::*;
pub use resolver::*;
pub use system_types::*;

pub type TypeId<'g> = RefId<'g, TypeData<'g>>;
pub type FieldId<'g> = RefId<'g, FieldData<'g>>;
pub type MethodId<'g> = RefId<'g, MethodData<'g>>;

/// Metadata table tags (the high byte of a token)
pub const TYPE_DEF_TABLE: u32 = 0x0200_0000;
pub const FIELD_TABLE: u32 = 0x0400_0000;
pub const METHOD_TABLE: u32 = 0x0600_0000;
pub const TYPE_SPEC_TABLE: u32 = 0x1B00_0000;

pub struct TypeGraphArenas<'g> {
    type_arena: Arena<TypeData<'g>>,
    field_arena: Arena<FieldData<'g>>,
    method_arena: Arena<MethodData<'g>>,
}

impl<'g> TypeGraphArenas<'g> {
    pub fn new() -> Self {
        TypeGraphArenas {
            type_arena: Arena::new(),
            field_arena: Arena::new(),
            method_arena: Arena::new(),
        }
    }
}

impl<'g> Default for TypeGraphArenas<'g> {
    fn default() -> Self {
        Self::new()
    }
}

/// Graph of all the types (and their members) visible to a method body under construction
pub struct TypeGraph<'g> {
    arenas: &'g TypeGraphArenas<'g>,
    types: FrozenMap<String, &'g TypeData<'g>>,

    /// Row counters for handing out metadata tokens
    type_def_rows: Cell<u32>,
    type_spec_rows: Cell<u32>,
    field_rows: Cell<u32>,
    method_rows: Cell<u32>,
}

impl<'g> TypeGraph<'g> {
    /// New empty graph
    pub fn new(arenas: &'g TypeGraphArenas<'g>) -> Self {
        TypeGraph {
            arenas,
            types: FrozenMap::new(),
            type_def_rows: Cell::new(0),
            type_spec_rows: Cell::new(0),
            field_rows: Cell::new(0),
            method_rows: Cell::new(0),
        }
    }

    fn next_token(rows: &Cell<u32>, table: u32) -> u32 {
        let row = rows.get() + 1;
        rows.set(row);
        table | row
    }

    /// Find a type by its full name (eg. `System.Int32` or `System.String[]`)
    pub fn lookup_type(&self, name: &str) -> Option<TypeId<'g>> {
        self.types.map_get(name, |data| RefId(*data))
    }

    /// Add a new type to the graph
    ///
    /// If a type with the same name already exists, that one is returned instead.
    pub fn add_type(
        &self,
        name: impl Into<String>,
        kind: TypeKind<'g>,
        base: Option<TypeId<'g>>,
        flags: TypeFlags,
    ) -> TypeId<'g> {
        let name = name.into();
        if let Some(existing) = self.lookup_type(&name) {
            return existing;
        }

        let token = match kind {
            TypeKind::Array(_) | TypeKind::ByRef(_) => {
                Self::next_token(&self.type_spec_rows, TYPE_SPEC_TABLE)
            }
            _ => Self::next_token(&self.type_def_rows, TYPE_DEF_TABLE),
        };
        let data: &'g TypeData<'g> = self.arenas.type_arena.alloc(TypeData {
            name: name.clone(),
            kind,
            base,
            interfaces: FrozenVec::new(),
            flags,
            fields: FrozenVec::new(),
            methods: FrozenVec::new(),
            token,
        });
        self.types.insert(name, data);
        RefId(data)
    }

    /// Add a reference type deriving from `base`
    pub fn add_class(
        &self,
        name: impl Into<String>,
        base: TypeId<'g>,
        flags: TypeFlags,
    ) -> TypeId<'g> {
        self.add_type(name, TypeKind::Class, Some(base), flags)
    }

    /// Add an interface type
    pub fn add_interface(&self, name: impl Into<String>) -> TypeId<'g> {
        self.add_type(
            name,
            TypeKind::Interface,
            None,
            TypeFlags::PUBLIC | TypeFlags::INTERFACE | TypeFlags::ABSTRACT,
        )
    }

    /// Add a user-defined value type (`base` should be `System.ValueType`)
    pub fn add_value_type(
        &self,
        name: impl Into<String>,
        base: TypeId<'g>,
        flags: TypeFlags,
    ) -> TypeId<'g> {
        self.add_type(
            name,
            TypeKind::ValueType,
            Some(base),
            flags | TypeFlags::SEALED,
        )
    }

    /// Add an enumeration over some integer primitive (`base` should be `System.Enum`)
    pub fn add_enum(
        &self,
        name: impl Into<String>,
        base: TypeId<'g>,
        underlying: PrimitiveType,
    ) -> TypeId<'g> {
        self.add_type(
            name,
            TypeKind::Enum(underlying),
            Some(base),
            TypeFlags::PUBLIC | TypeFlags::SEALED,
        )
    }

    /// Single dimensional, zero-based array type with the given element type
    pub fn array_of(&self, element: TypeId<'g>) -> TypeId<'g> {
        let base = self.lookup_type(SystemTypes::ARRAY);
        self.add_type(
            format!("{}[]", element.name),
            TypeKind::Array(element),
            base,
            TypeFlags::PUBLIC | TypeFlags::SEALED,
        )
    }

    /// Managed reference to a location of the given type
    pub fn by_ref(&self, referent: TypeId<'g>) -> TypeId<'g> {
        self.add_type(
            format!("{}&", referent.name),
            TypeKind::ByRef(referent),
            None,
            TypeFlags::empty(),
        )
    }

    /// Record that `class` implements `interface`
    pub fn add_interface_impl(&self, class: TypeId<'g>, interface: TypeId<'g>) {
        if !class.interfaces.iter().any(|i| RefId(i) == interface) {
            class.0.interfaces.push(interface);
        }
    }

    /// Add a field to the graph and to its owning type
    pub fn add_field(
        &self,
        owner: TypeId<'g>,
        name: impl Into<String>,
        field_type: TypeId<'g>,
        flags: FieldFlags,
    ) -> FieldId<'g> {
        let name = name.into();
        if let Some(existing) = owner.0.fields.iter().find(|f| f.name == name) {
            return RefId(existing);
        }
        let data: &'g FieldData<'g> = self.arenas.field_arena.alloc(FieldData {
            owner,
            name,
            field_type,
            flags,
            token: Self::next_token(&self.field_rows, FIELD_TABLE),
        });
        owner.0.fields.push(RefId(data));
        RefId(data)
    }

    /// Add a method to the graph and to its owning type
    ///
    /// Methods are deduplicated on name, parameter types, and staticness.
    pub fn add_method(
        &self,
        owner: TypeId<'g>,
        name: impl Into<String>,
        parameters: Vec<TypeId<'g>>,
        return_type: Option<TypeId<'g>>,
        flags: MethodFlags,
    ) -> MethodId<'g> {
        let name = name.into();
        let is_static = flags.contains(MethodFlags::STATIC);
        if let Some(existing) = owner.0.methods.iter().find(|m| {
            m.name == name && m.parameters == parameters && m.is_static() == is_static
        }) {
            return RefId(existing);
        }
        let data: &'g MethodData<'g> = self.arenas.method_arena.alloc(MethodData {
            owner,
            name,
            parameters,
            return_type,
            flags,
            token: Self::next_token(&self.method_rows, METHOD_TABLE),
        });
        owner.0.methods.push(RefId(data));
        RefId(data)
    }

    /// Add standard types to the graph
    pub fn insert_system_types(&self) -> SystemTypes<'g> {
        SystemTypes::add_to_graph(self)
    }
}

/// Primitive types that the VM knows natively
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    IntPtr,
    UIntPtr,
    F32,
    F64,
}

impl PrimitiveType {
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveType::F32 | PrimitiveType::F64)
    }

    /// Unsigned integers, including `char`, `bool`, and the unsigned native integer
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            PrimitiveType::Boolean
                | PrimitiveType::Char
                | PrimitiveType::U8
                | PrimitiveType::U16
                | PrimitiveType::U32
                | PrimitiveType::U64
                | PrimitiveType::UIntPtr
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeKind<'g> {
    Primitive(PrimitiveType),
    Class,
    Interface,
    ValueType,
    Enum(PrimitiveType),
    Array(TypeId<'g>),
    ByRef(TypeId<'g>),
}

pub struct TypeData<'g> {
    /// Full name of the type
    pub name: String,

    pub kind: TypeKind<'g>,

    /// Base type is only missing for `System.Object`, interfaces, and by-refs
    pub base: Option<TypeId<'g>>,

    /// Interfaces implemented (or super-interfaces)
    pub interfaces: FrozenVec<TypeId<'g>>,

    pub flags: TypeFlags,

    pub fields: FrozenVec<FieldId<'g>>,

    pub methods: FrozenVec<MethodId<'g>>,

    /// Metadata token (`TypeDef` or `TypeSpec`)
    pub token: u32,
}

impl<'g> TypeData<'g> {
    /// Values of this type live directly on the stack (as opposed to behind a reference)
    pub fn is_value_type(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Primitive(_) | TypeKind::ValueType | TypeKind::Enum(_)
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Class | TypeKind::Interface | TypeKind::Array(_)
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.kind, TypeKind::Interface)
    }

    /// Sealed types cannot be derived from (value types are always sealed)
    pub fn is_sealed(&self) -> bool {
        self.is_value_type() || self.flags.contains(TypeFlags::SEALED)
    }

    /// Primitive representation, if there is one (enums are represented by their underlying type)
    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self.kind {
            TypeKind::Primitive(p) | TypeKind::Enum(p) => Some(p),
            _ => None,
        }
    }

    /// Value types which are not primitives or enums (these need `ldobj`/`stobj` to move around)
    pub fn is_struct(&self) -> bool {
        matches!(self.kind, TypeKind::ValueType)
    }

    pub fn element_type(&self) -> Option<TypeId<'g>> {
        match self.kind {
            TypeKind::Array(element) => Some(element),
            _ => None,
        }
    }
}

impl<'g> fmt::Debug for TypeData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub struct FieldData<'g> {
    /// Type declaring the field
    ///
    /// Note: this is a pointer back to the type (so don't derive `Debug`)
    pub owner: TypeId<'g>,

    pub name: String,

    pub field_type: TypeId<'g>,

    pub flags: FieldFlags,

    pub token: u32,
}

impl<'g> FieldData<'g> {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }
}

impl<'g> fmt::Debug for FieldData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.field_type.name, self.owner.name, self.name)
    }
}

pub struct MethodData<'g> {
    /// Type declaring the method
    pub owner: TypeId<'g>,

    pub name: String,

    /// Declared parameter types (not including any receiver)
    pub parameters: Vec<TypeId<'g>>,

    /// `None` for `void` methods
    pub return_type: Option<TypeId<'g>>,

    pub flags: MethodFlags,

    pub token: u32,
}

impl<'g> MethodData<'g> {
    pub const CONSTRUCTOR: &'static str = ".ctor";

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodFlags::VIRTUAL)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == Self::CONSTRUCTOR
    }

    /// The parts of the method that matter for calling it
    pub fn signature(&self) -> MemberSignature<'g> {
        MemberSignature {
            parameter_types: self.parameters.clone(),
            return_type: self.return_type,
            is_static: self.is_static(),
            is_virtual: self.is_virtual(),
            declaring_type_is_value_type: self.owner.is_value_type(),
        }
    }
}

impl<'g> fmt::Debug for MethodData<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.return_type {
            Some(return_type) => write!(f, "{} ", return_type.name)?,
            None => f.write_str("void ")?,
        }
        write!(f, "{}::{}(", self.owner.name, self.name)?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&parameter.name)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::FieldFlags;

    #[test]
    fn interning_and_tokens() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();

        let ints = graph.array_of(system.int32);
        assert_eq!(ints.name, "System.Int32[]");
        assert_eq!(graph.array_of(system.int32), ints);
        assert_eq!(ints.element_type(), Some(system.int32));
        assert_eq!(ints.base, Some(system.array));
        assert_eq!(ints.token & 0xFF00_0000, TYPE_SPEC_TABLE);

        let point = graph.add_value_type("Test.Point", system.value_type, TypeFlags::PUBLIC);
        assert_eq!(point.token & 0xFF00_0000, TYPE_DEF_TABLE);
        assert!(point.is_value_type() && point.is_struct() && point.is_sealed());
        assert_eq!(graph.lookup_type("Test.Point"), Some(point));
        assert_eq!(graph.lookup_type("Test.Missing"), None);
    }

    #[test]
    fn members_are_deduplicated() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();

        let class = graph.add_class("Test.Widget", system.object, TypeFlags::PUBLIC);
        let m1 = graph.add_method(
            class,
            "Frob",
            vec![system.int32],
            None,
            MethodFlags::PUBLIC,
        );
        let m2 = graph.add_method(
            class,
            "Frob",
            vec![system.int32],
            None,
            MethodFlags::PUBLIC,
        );
        let m3 = graph.add_method(
            class,
            "Frob",
            vec![system.int64],
            None,
            MethodFlags::PUBLIC,
        );
        assert_eq!(m1, m2);
        assert_ne!(m1, m3);
        assert_eq!(class.methods.len(), 2);
        assert_eq!(format!("{:?}", m1), "void Test.Widget::Frob(System.Int32)");

        let f1 = graph.add_field(class, "count", system.int32, FieldFlags::PUBLIC);
        let f2 = graph.add_field(class, "count", system.int32, FieldFlags::PUBLIC);
        assert_eq!(f1, f2);
        assert_eq!(graph.resolve_field(class, "count").ok(), Some(f1));
        assert_eq!(f1.token & 0xFF00_0000, FIELD_TABLE);
    }
}
