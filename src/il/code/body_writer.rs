use super::{BranchInstruction, BytecodeSink, Comparison, Instruction, Label, Region, RegionKind};
use crate::il::type_graph::{PrimitiveType, TypeId};
use crate::il::Error;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::Result as IoResult;

/// Token table tag for user strings (`ldstr`)
pub const USER_STRING_TABLE: u32 = 0x7000_0000;

/// Two-byte opcodes all start with this byte
const PREFIX: u8 = 0xFE;

/// Sink that encodes instructions into a method body
///
/// Arguments, locals, and integer constants use the shortest encoding available. Branches always
/// use the long (32-bit offset) forms, so their size is known up front and offsets can be patched
/// in once the body is finished.
#[derive(Default)]
pub struct BodyWriter {
    code: Vec<u8>,

    /// Offset of every placed label
    label_offsets: HashMap<Label, u32>,

    /// Branch offsets to fill in once all labels are placed
    fixups: Vec<Fixup>,

    /// Interned strings (the token of a string is its index plus one)
    user_strings: Vec<String>,
    user_string_tokens: HashMap<String, u32>,

    /// Protected blocks: start offset and (once the first handler starts) end offset
    protected_blocks: HashMap<Region, (u32, Option<u32>)>,

    /// Open handlers
    handlers: HashMap<Region, OpenHandler>,

    /// Start of a filter whose catch handler has yet to start, keyed by protected block
    pending_filters: HashMap<Region, u32>,

    clauses: Vec<ExceptionClause>,
}

struct Fixup {
    /// Position of the 32-bit offset in the code
    position: usize,

    /// Offsets are relative to the end of the instruction
    base: u32,

    target: Label,
}

struct OpenHandler {
    try_region: Region,
    kind: ClauseKind,
    class_token: u32,
    filter_offset: Option<u32>,
    start: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClauseKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

impl ClauseKind {
    pub fn flags(self) -> u32 {
        match self {
            ClauseKind::Catch => 0x0,
            ClauseKind::Filter => 0x1,
            ClauseKind::Finally => 0x2,
            ClauseKind::Fault => 0x4,
        }
    }
}

/// Entry in the exception handling table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,

    /// Exception type token (only for `Catch`)
    pub class_token: u32,

    /// Start of the filter block (only for `Filter`)
    pub filter_offset: u32,
}

impl ExceptionClause {
    /// Write out the clause in the "fat" layout (six 32-bit fields)
    pub fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> IoResult<()> {
        writer.write_u32::<LittleEndian>(self.kind.flags())?;
        writer.write_u32::<LittleEndian>(self.try_offset)?;
        writer.write_u32::<LittleEndian>(self.try_length)?;
        writer.write_u32::<LittleEndian>(self.handler_offset)?;
        writer.write_u32::<LittleEndian>(self.handler_length)?;
        let last = match self.kind {
            ClauseKind::Filter => self.filter_offset,
            _ => self.class_token,
        };
        writer.write_u32::<LittleEndian>(last)
    }
}

/// Encoded method body
#[derive(Debug)]
pub struct MethodBody {
    pub code: Vec<u8>,

    /// Innermost clauses come first
    pub exception_clauses: Vec<ExceptionClause>,

    pub user_strings: Vec<String>,
}

impl BodyWriter {
    pub fn new() -> BodyWriter {
        BodyWriter::default()
    }

    /// Current offset in the code
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Resolve branch offsets
    pub fn finish(mut self) -> Result<MethodBody, Error> {
        for fixup in &self.fixups {
            let target = *self
                .label_offsets
                .get(&fixup.target)
                .ok_or(Error::UnknownLabel(fixup.target))?;
            let relative = target as i64 - fixup.base as i64;
            LittleEndian::write_i32(
                &mut self.code[fixup.position..fixup.position + 4],
                relative as i32,
            );
        }
        if let Some(region) = self.handlers.keys().chain(self.protected_blocks.keys()).next() {
            return Err(Error::InvalidRegionNesting(format!(
                "{:?} was never closed",
                region
            )));
        }
        Ok(MethodBody {
            code: self.code,
            exception_clauses: self.clauses,
            user_strings: self.user_strings,
        })
    }

    fn user_string_token(&mut self, string: &str) -> u32 {
        if let Some(token) = self.user_string_tokens.get(string) {
            return *token;
        }
        self.user_strings.push(string.to_owned());
        let token = USER_STRING_TABLE | self.user_strings.len() as u32;
        self.user_string_tokens.insert(string.to_owned(), token);
        token
    }

    fn opcode(&mut self, opcode: u8) -> IoResult<()> {
        self.code.write_u8(opcode)
    }

    fn prefixed_opcode(&mut self, opcode: u8) -> IoResult<()> {
        self.code.write_u8(PREFIX)?;
        self.code.write_u8(opcode)
    }

    fn with_token(&mut self, opcode: u8, token: u32) -> IoResult<()> {
        self.opcode(opcode)?;
        self.code.write_u32::<LittleEndian>(token)
    }

    /// Argument or local access, picking between the macro, short, and long forms
    ///
    /// `macro_base` is the opcode for index 0 (if there are macro forms), `short` is the one-byte
    /// index form, and `long` is the second byte of the two-byte form.
    fn indexed(
        &mut self,
        index: u16,
        macro_base: Option<u8>,
        short: u8,
        long: u8,
    ) -> IoResult<()> {
        match (macro_base, index) {
            (Some(base), 0..=3) => self.opcode(base + index as u8),
            (_, 0..=255) => {
                self.opcode(short)?;
                self.code.write_u8(index as u8)
            }
            _ => {
                self.prefixed_opcode(long)?;
                self.code.write_u16::<LittleEndian>(index)
            }
        }
    }

    fn load_int(&mut self, value: i32) -> IoResult<()> {
        match value {
            -1..=8 => self.opcode((0x16 + value) as u8),
            -128..=127 => {
                self.opcode(0x1F)?;
                self.code.write_i8(value as i8)
            }
            _ => {
                self.opcode(0x20)?;
                self.code.write_i32::<LittleEndian>(value)
            }
        }
    }

    fn branch(&mut self, opcode: u8, target: Label) -> IoResult<()> {
        self.opcode(opcode)?;
        let position = self.code.len();
        self.code.write_i32::<LittleEndian>(0)?;
        self.fixups.push(Fixup {
            position,
            base: self.offset(),
            target,
        });
        Ok(())
    }

    fn switch(&mut self, targets: &[Label]) -> IoResult<()> {
        self.opcode(0x45)?;
        self.code.write_u32::<LittleEndian>(targets.len() as u32)?;
        let base = self.offset() + 4 * targets.len() as u32;
        for target in targets {
            let position = self.code.len();
            self.code.write_i32::<LittleEndian>(0)?;
            self.fixups.push(Fixup {
                position,
                base,
                target: *target,
            });
        }
        Ok(())
    }

    fn encode(&mut self, insn: &Instruction<'_>) -> IoResult<()> {
        use Instruction::*;

        match insn {
            Nop => self.opcode(0x00),
            LdArg(idx) => self.indexed(*idx, Some(0x02), 0x0E, 0x09),
            LdArgA(idx) => self.indexed(*idx, None, 0x0F, 0x0A),
            StArg(idx) => self.indexed(*idx, None, 0x10, 0x0B),
            LdLoc(idx) => self.indexed(*idx, Some(0x06), 0x11, 0x0C),
            LdLocA(idx) => self.indexed(*idx, None, 0x12, 0x0D),
            StLoc(idx) => self.indexed(*idx, Some(0x0A), 0x13, 0x0E),
            LdNull => self.opcode(0x14),
            LdcI4(value) => self.load_int(*value),
            LdcI8(value) => {
                self.opcode(0x21)?;
                self.code.write_i64::<LittleEndian>(*value)
            }
            LdcR4(value) => {
                self.opcode(0x22)?;
                self.code.write_f32::<LittleEndian>(*value)
            }
            LdcR8(value) => {
                self.opcode(0x23)?;
                self.code.write_f64::<LittleEndian>(*value)
            }
            LdStr(string) => {
                let token = self.user_string_token(string);
                self.with_token(0x72, token)
            }
            Dup => self.opcode(0x25),
            Pop => self.opcode(0x26),
            Add => self.opcode(0x58),
            Sub => self.opcode(0x59),
            Mul => self.opcode(0x5A),
            Div => self.opcode(0x5B),
            DivUn => self.opcode(0x5C),
            Rem => self.opcode(0x5D),
            RemUn => self.opcode(0x5E),
            And => self.opcode(0x5F),
            Or => self.opcode(0x60),
            Xor => self.opcode(0x61),
            Shl => self.opcode(0x62),
            Shr => self.opcode(0x63),
            ShrUn => self.opcode(0x64),
            Neg => self.opcode(0x65),
            Not => self.opcode(0x66),
            AddOvf => self.opcode(0xD6),
            AddOvfUn => self.opcode(0xD7),
            MulOvf => self.opcode(0xD8),
            MulOvfUn => self.opcode(0xD9),
            SubOvf => self.opcode(0xDA),
            SubOvfUn => self.opcode(0xDB),
            Ceq => self.prefixed_opcode(0x01),
            Cgt => self.prefixed_opcode(0x02),
            CgtUn => self.prefixed_opcode(0x03),
            Clt => self.prefixed_opcode(0x04),
            CltUn => self.prefixed_opcode(0x05),
            Conv {
                to,
                checked,
                unsigned_source,
            } => self.conversion(*to, *checked, *unsigned_source),
            LdFld(field) => self.with_token(0x7B, field.token),
            LdFldA(field) => self.with_token(0x7C, field.token),
            StFld(field) => self.with_token(0x7D, field.token),
            LdSFld(field) => self.with_token(0x7E, field.token),
            LdSFldA(field) => self.with_token(0x7F, field.token),
            StSFld(field) => self.with_token(0x80, field.token),
            LdElem(ty) => self.with_token(0xA3, ty.token),
            LdElemA(ty) => self.with_token(0x8F, ty.token),
            StElem(ty) => self.with_token(0xA4, ty.token),
            LdLen => self.opcode(0x8E),
            NewArr(ty) => self.with_token(0x8D, ty.token),
            LdInd(ty) => match indirect_opcodes(*ty) {
                Some((load, _)) => self.opcode(load),
                None => self.with_token(0x71, ty.token),
            },
            StInd(ty) => match indirect_opcodes(*ty) {
                Some((_, store)) => self.opcode(store),
                None => self.with_token(0x81, ty.token),
            },
            LdObj(ty) => self.with_token(0x71, ty.token),
            StObj(ty) => self.with_token(0x81, ty.token),
            InitObj(ty) => {
                self.prefixed_opcode(0x15)?;
                self.code.write_u32::<LittleEndian>(ty.token)
            }
            Box(ty) => self.with_token(0x8C, ty.token),
            Unbox(ty) => self.with_token(0x79, ty.token),
            UnboxAny(ty) => self.with_token(0xA5, ty.token),
            CastClass(ty) => self.with_token(0x74, ty.token),
            IsInst(ty) => self.with_token(0x75, ty.token),
            NewObj(method) => self.with_token(0x73, method.token),
            Call(method) => self.with_token(0x28, method.token),
            CallVirt(method) => self.with_token(0x6F, method.token),
            Constrained(ty) => {
                self.prefixed_opcode(0x16)?;
                self.code.write_u32::<LittleEndian>(ty.token)
            }
            LdFtn(method) => {
                self.prefixed_opcode(0x06)?;
                self.code.write_u32::<LittleEndian>(method.token)
            }
            LdVirtFtn(method) => {
                self.prefixed_opcode(0x07)?;
                self.code.write_u32::<LittleEndian>(method.token)
            }
            SizeOf(ty) => {
                self.prefixed_opcode(0x1C)?;
                self.code.write_u32::<LittleEndian>(ty.token)
            }
        }
    }

    fn conversion(
        &mut self,
        to: PrimitiveType,
        checked: bool,
        unsigned_source: bool,
    ) -> IoResult<()> {
        use PrimitiveType::*;

        if to.is_float() {
            if unsigned_source {
                self.opcode(0x76)?;
            }
            return match (to, unsigned_source) {
                (F64, true) => Ok(()),
                (F32, _) => self.opcode(0x6B),
                _ => self.opcode(0x6C),
            };
        }

        let opcode = match (checked, unsigned_source, to) {
            (false, _, I8) => 0x67,
            (false, _, I16) => 0x68,
            (false, _, I32) => 0x69,
            (false, _, I64) => 0x6A,
            (false, _, U8 | Boolean) => 0xD2,
            (false, _, U16 | Char) => 0xD1,
            (false, _, U32) => 0x6D,
            (false, _, U64) => 0x6E,
            (false, _, IntPtr) => 0xD3,
            (false, _, UIntPtr) => 0xE0,

            (true, false, I8) => 0xB3,
            (true, false, U8 | Boolean) => 0xB4,
            (true, false, I16) => 0xB5,
            (true, false, U16 | Char) => 0xB6,
            (true, false, I32) => 0xB7,
            (true, false, U32) => 0xB8,
            (true, false, I64) => 0xB9,
            (true, false, U64) => 0xBA,
            (true, false, IntPtr) => 0xD4,
            (true, false, UIntPtr) => 0xD5,

            (true, true, I8) => 0x82,
            (true, true, I16) => 0x83,
            (true, true, I32) => 0x84,
            (true, true, I64) => 0x85,
            (true, true, U8 | Boolean) => 0x86,
            (true, true, U16 | Char) => 0x87,
            (true, true, U32) => 0x88,
            (true, true, U64) => 0x89,
            (true, true, IntPtr) => 0x8A,
            (true, true, UIntPtr) => 0x8B,

            (_, _, F32 | F64) => 0x6C,
        };
        self.opcode(opcode)
    }

    fn encode_branch(&mut self, insn: &BranchInstruction<Label>) -> IoResult<()> {
        match insn {
            BranchInstruction::Br(lbl) => self.branch(0x38, *lbl),
            BranchInstruction::BrFalse(lbl) => self.branch(0x39, *lbl),
            BranchInstruction::BrTrue(lbl) => self.branch(0x3A, *lbl),
            BranchInstruction::BranchIf(cmp, lbl) => {
                let opcode = match cmp {
                    Comparison::Eq => 0x3B,
                    Comparison::Ge => 0x3C,
                    Comparison::Gt => 0x3D,
                    Comparison::Le => 0x3E,
                    Comparison::Lt => 0x3F,
                    Comparison::NeUn => 0x40,
                    Comparison::GeUn => 0x41,
                    Comparison::GtUn => 0x42,
                    Comparison::LeUn => 0x43,
                    Comparison::LtUn => 0x44,
                };
                self.branch(opcode, *lbl)
            }
            BranchInstruction::Switch(lbls) => self.switch(lbls),
            BranchInstruction::Leave(lbl) => self.branch(0xDD, *lbl),
            BranchInstruction::Ret => self.opcode(0x2A),
            BranchInstruction::Throw => self.opcode(0x7A),
            BranchInstruction::Rethrow => self.prefixed_opcode(0x1A),
            BranchInstruction::EndFinally => self.opcode(0xDC),
            BranchInstruction::EndFilter => self.prefixed_opcode(0x11),
        }
    }
}

/// `ldind.*`/`stind.*` opcodes for a referent type (`None` means use `ldobj`/`stobj`)
fn indirect_opcodes(ty: TypeId<'_>) -> Option<(u8, u8)> {
    use PrimitiveType::*;

    if ty.is_reference() {
        return Some((0x50, 0x51));
    }
    let opcodes = match ty.primitive()? {
        I8 => (0x46, 0x52),
        U8 | Boolean => (0x47, 0x52),
        I16 => (0x48, 0x53),
        U16 | Char => (0x49, 0x53),
        I32 => (0x4A, 0x54),
        U32 => (0x4B, 0x54),
        I64 | U64 => (0x4C, 0x55),
        IntPtr | UIntPtr => (0x4D, 0xDF),
        F32 => (0x4E, 0x56),
        F64 => (0x4F, 0x57),
    };
    Some(opcodes)
}

impl<'g> BytecodeSink<'g> for BodyWriter {
    fn emit(&mut self, insn: &Instruction<'g>) -> Result<(), Error> {
        Ok(self.encode(insn)?)
    }

    fn emit_branch(&mut self, insn: &BranchInstruction<Label>) -> Result<(), Error> {
        Ok(self.encode_branch(insn)?)
    }

    fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        let offset = self.offset();
        if self.label_offsets.insert(label, offset).is_some() {
            return Err(Error::DuplicateLabel(label));
        }
        Ok(())
    }

    fn begin_region(
        &mut self,
        region: Region,
        kind: RegionKind<'g>,
        try_region: Option<Region>,
    ) -> Result<(), Error> {
        let offset = self.offset();
        let try_region = match try_region {
            None => {
                self.protected_blocks.insert(region, (offset, None));
                return Ok(());
            }
            Some(try_region) => try_region,
        };

        // The protected block ends where its first handler starts
        match self.protected_blocks.get_mut(&try_region) {
            Some((_, end @ None)) => *end = Some(offset),
            Some(_) => (),
            None => {
                return Err(Error::InvalidRegionNesting(format!(
                    "{:?} is not an open protected block",
                    try_region
                )))
            }
        }

        let (clause_kind, class_token, filter_offset) = match kind {
            RegionKind::Try => {
                return Err(Error::InvalidRegionNesting(String::from(
                    "a protected block is not a handler",
                )))
            }
            RegionKind::Filter => {
                self.pending_filters.insert(try_region, offset);
                (ClauseKind::Filter, 0, None)
            }
            RegionKind::Catch(ty) => match self.pending_filters.remove(&try_region) {
                Some(filter_offset) => (ClauseKind::Filter, 0, Some(filter_offset)),
                None => (ClauseKind::Catch, ty.token, None),
            },
            RegionKind::Finally => (ClauseKind::Finally, 0, None),
            RegionKind::Fault => (ClauseKind::Fault, 0, None),
        };
        self.handlers.insert(
            region,
            OpenHandler {
                try_region,
                kind: clause_kind,
                class_token,
                filter_offset,
                start: offset,
            },
        );
        Ok(())
    }

    fn end_region(&mut self, region: Region) -> Result<(), Error> {
        let offset = self.offset();
        if self.protected_blocks.remove(&region).is_some() {
            return Ok(());
        }

        let handler = self
            .handlers
            .remove(&region)
            .ok_or_else(|| Error::InvalidRegionNesting(format!("{:?} is not open", region)))?;

        // The filter block itself is described by the clause of the handler following it
        if handler.kind == ClauseKind::Filter && handler.filter_offset.is_none() {
            return Ok(());
        }

        let (try_offset, try_end) = match self.protected_blocks.get(&handler.try_region) {
            Some((start, Some(end))) => (*start, *end),
            _ => {
                return Err(Error::InvalidRegionNesting(format!(
                    "{:?} is not an open protected block",
                    handler.try_region
                )))
            }
        };
        self.clauses.push(ExceptionClause {
            kind: handler.kind,
            try_offset,
            try_length: try_end - try_offset,
            handler_offset: handler.start,
            handler_length: offset - handler.start,
            class_token: handler.class_token,
            filter_offset: handler.filter_offset.unwrap_or(0),
        });
        Ok(())
    }
}
