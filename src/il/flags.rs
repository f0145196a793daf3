use bitflags::bitflags;

bitflags! {
    /// Attributes on types
    ///
    /// The bit values match the type attribute encoding in the metadata tables.
    pub struct TypeFlags: u32 {
        const PUBLIC = 0x0000_0001;
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
    }
}

bitflags! {
    /// Attributes on methods
    pub struct MethodFlags: u16 {
        const PRIVATE = 0x0001;
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
        const FINAL = 0x0020;
        const VIRTUAL = 0x0040;
        const HIDE_BY_SIG = 0x0080;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
    }
}

bitflags! {
    /// Attributes on fields
    pub struct FieldFlags: u16 {
        const PRIVATE = 0x0001;
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
        const INIT_ONLY = 0x0020;
        const LITERAL = 0x0040;
    }
}
