use crate::il::type_graph::{FieldId, MethodId, PrimitiveType, TypeId};
use std::fmt;

/// Non-branching instructions
///
/// Argument and local indices are always the long forms here: picking the short encodings is the
/// job of the sink (see [`super::BodyWriter`]).
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction<'g> {
    Nop,

    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),

    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    LdStr(String),

    Dup,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,

    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,

    /// Numeric conversion
    ///
    /// `checked` conversions throw on overflow, and `unsigned_source` says to interpret the
    /// source as unsigned (this only matters for checked conversions and conversions to floats).
    Conv {
        to: PrimitiveType,
        checked: bool,
        unsigned_source: bool,
    },

    LdFld(FieldId<'g>),
    LdFldA(FieldId<'g>),
    StFld(FieldId<'g>),
    LdSFld(FieldId<'g>),
    LdSFldA(FieldId<'g>),
    StSFld(FieldId<'g>),

    /// Array accesses (the type is the element type)
    LdElem(TypeId<'g>),
    LdElemA(TypeId<'g>),
    StElem(TypeId<'g>),
    LdLen,
    NewArr(TypeId<'g>),

    /// Indirect accesses through an address (the type is the referent type)
    LdInd(TypeId<'g>),
    StInd(TypeId<'g>),
    LdObj(TypeId<'g>),
    StObj(TypeId<'g>),
    InitObj(TypeId<'g>),

    Box(TypeId<'g>),
    Unbox(TypeId<'g>),
    UnboxAny(TypeId<'g>),
    CastClass(TypeId<'g>),
    IsInst(TypeId<'g>),

    NewObj(MethodId<'g>),
    Call(MethodId<'g>),
    CallVirt(MethodId<'g>),

    /// Prefix for the `callvirt` that must immediately follow
    Constrained(TypeId<'g>),

    LdFtn(MethodId<'g>),
    LdVirtFtn(MethodId<'g>),
    SizeOf(TypeId<'g>),
}

/// Comparisons for conditional branches
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Comparison {
    Eq,
    NeUn,
    Ge,
    GeUn,
    Gt,
    GtUn,
    Le,
    LeUn,
    Lt,
    LtUn,
}

impl Comparison {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Comparison::Eq => "beq",
            Comparison::NeUn => "bne.un",
            Comparison::Ge => "bge",
            Comparison::GeUn => "bge.un",
            Comparison::Gt => "bgt",
            Comparison::GtUn => "bgt.un",
            Comparison::Le => "ble",
            Comparison::LeUn => "ble.un",
            Comparison::Lt => "blt",
            Comparison::LtUn => "blt.un",
        }
    }
}

/// Instructions which may transfer control somewhere other than the next instruction
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BranchInstruction<Lbl> {
    Br(Lbl),
    BrTrue(Lbl),
    BrFalse(Lbl),
    BranchIf(Comparison, Lbl),
    Switch(Vec<Lbl>),

    /// Exit a protected region or a `catch` handler (empties the stack)
    Leave(Lbl),

    Ret,
    Throw,
    Rethrow,
    EndFinally,
    EndFilter,
}

impl<Lbl> BranchInstruction<Lbl> {
    /// Labels that this instruction might jump to (not including the fall through)
    pub fn jump_targets(&self) -> Vec<&Lbl> {
        match self {
            BranchInstruction::Br(lbl)
            | BranchInstruction::BrTrue(lbl)
            | BranchInstruction::BrFalse(lbl)
            | BranchInstruction::BranchIf(_, lbl)
            | BranchInstruction::Leave(lbl) => vec![lbl],
            BranchInstruction::Switch(lbls) => lbls.iter().collect(),
            BranchInstruction::Ret
            | BranchInstruction::Throw
            | BranchInstruction::Rethrow
            | BranchInstruction::EndFinally
            | BranchInstruction::EndFilter => vec![],
        }
    }

    /// Is the next instruction unreachable from this one?
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            BranchInstruction::BrTrue(_)
                | BranchInstruction::BrFalse(_)
                | BranchInstruction::BranchIf(_, _)
                | BranchInstruction::Switch(_)
        )
    }

    pub fn map_labels<Lbl2>(&self, map_label: impl Fn(&Lbl) -> Lbl2) -> BranchInstruction<Lbl2> {
        match self {
            BranchInstruction::Br(lbl) => BranchInstruction::Br(map_label(lbl)),
            BranchInstruction::BrTrue(lbl) => BranchInstruction::BrTrue(map_label(lbl)),
            BranchInstruction::BrFalse(lbl) => BranchInstruction::BrFalse(map_label(lbl)),
            BranchInstruction::BranchIf(cmp, lbl) => {
                BranchInstruction::BranchIf(*cmp, map_label(lbl))
            }
            BranchInstruction::Switch(lbls) => {
                BranchInstruction::Switch(lbls.iter().map(map_label).collect())
            }
            BranchInstruction::Leave(lbl) => BranchInstruction::Leave(map_label(lbl)),
            BranchInstruction::Ret => BranchInstruction::Ret,
            BranchInstruction::Throw => BranchInstruction::Throw,
            BranchInstruction::Rethrow => BranchInstruction::Rethrow,
            BranchInstruction::EndFinally => BranchInstruction::EndFinally,
            BranchInstruction::EndFilter => BranchInstruction::EndFilter,
        }
    }
}

fn conv_mnemonic(to: PrimitiveType, checked: bool, unsigned_source: bool) -> String {
    let target = match to {
        PrimitiveType::I8 => "i1",
        PrimitiveType::U8 | PrimitiveType::Boolean => "u1",
        PrimitiveType::I16 => "i2",
        PrimitiveType::U16 | PrimitiveType::Char => "u2",
        PrimitiveType::I32 => "i4",
        PrimitiveType::U32 => "u4",
        PrimitiveType::I64 => "i8",
        PrimitiveType::U64 => "u8",
        PrimitiveType::IntPtr => "i",
        PrimitiveType::UIntPtr => "u",
        PrimitiveType::F32 => "r4",
        PrimitiveType::F64 => "r8",
    };
    match (checked, unsigned_source, to.is_float()) {
        (false, true, true) => format!("conv.r.un (to {})", target),
        (false, _, _) => format!("conv.{}", target),
        (true, false, _) => format!("conv.ovf.{}", target),
        (true, true, _) => format!("conv.ovf.{}.un", target),
    }
}

/// Renders in the usual assembler syntax (eg. `ldfld System.Int32 Test.Point::x`)
impl<'g> fmt::Display for Instruction<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            Nop => f.write_str("nop"),
            LdArg(idx) => write!(f, "ldarg {}", idx),
            LdArgA(idx) => write!(f, "ldarga {}", idx),
            StArg(idx) => write!(f, "starg {}", idx),
            LdLoc(idx) => write!(f, "ldloc {}", idx),
            LdLocA(idx) => write!(f, "ldloca {}", idx),
            StLoc(idx) => write!(f, "stloc {}", idx),
            LdNull => f.write_str("ldnull"),
            LdcI4(i) => write!(f, "ldc.i4 {}", i),
            LdcI8(i) => write!(f, "ldc.i8 {}", i),
            LdcR4(r) => write!(f, "ldc.r4 {}", r),
            LdcR8(r) => write!(f, "ldc.r8 {}", r),
            LdStr(s) => write!(f, "ldstr {:?}", s),
            Dup => f.write_str("dup"),
            Pop => f.write_str("pop"),
            Add => f.write_str("add"),
            Sub => f.write_str("sub"),
            Mul => f.write_str("mul"),
            Div => f.write_str("div"),
            DivUn => f.write_str("div.un"),
            Rem => f.write_str("rem"),
            RemUn => f.write_str("rem.un"),
            And => f.write_str("and"),
            Or => f.write_str("or"),
            Xor => f.write_str("xor"),
            Shl => f.write_str("shl"),
            Shr => f.write_str("shr"),
            ShrUn => f.write_str("shr.un"),
            Neg => f.write_str("neg"),
            Not => f.write_str("not"),
            AddOvf => f.write_str("add.ovf"),
            AddOvfUn => f.write_str("add.ovf.un"),
            SubOvf => f.write_str("sub.ovf"),
            SubOvfUn => f.write_str("sub.ovf.un"),
            MulOvf => f.write_str("mul.ovf"),
            MulOvfUn => f.write_str("mul.ovf.un"),
            Ceq => f.write_str("ceq"),
            Cgt => f.write_str("cgt"),
            CgtUn => f.write_str("cgt.un"),
            Clt => f.write_str("clt"),
            CltUn => f.write_str("clt.un"),
            Conv {
                to,
                checked,
                unsigned_source,
            } => f.write_str(&conv_mnemonic(*to, *checked, *unsigned_source)),
            LdFld(field) => write!(f, "ldfld {:?}", field),
            LdFldA(field) => write!(f, "ldflda {:?}", field),
            StFld(field) => write!(f, "stfld {:?}", field),
            LdSFld(field) => write!(f, "ldsfld {:?}", field),
            LdSFldA(field) => write!(f, "ldsflda {:?}", field),
            StSFld(field) => write!(f, "stsfld {:?}", field),
            LdElem(ty) => write!(f, "ldelem {:?}", ty),
            LdElemA(ty) => write!(f, "ldelema {:?}", ty),
            StElem(ty) => write!(f, "stelem {:?}", ty),
            LdLen => f.write_str("ldlen"),
            NewArr(ty) => write!(f, "newarr {:?}", ty),
            LdInd(ty) => write!(f, "ldind {:?}", ty),
            StInd(ty) => write!(f, "stind {:?}", ty),
            LdObj(ty) => write!(f, "ldobj {:?}", ty),
            StObj(ty) => write!(f, "stobj {:?}", ty),
            InitObj(ty) => write!(f, "initobj {:?}", ty),
            Box(ty) => write!(f, "box {:?}", ty),
            Unbox(ty) => write!(f, "unbox {:?}", ty),
            UnboxAny(ty) => write!(f, "unbox.any {:?}", ty),
            CastClass(ty) => write!(f, "castclass {:?}", ty),
            IsInst(ty) => write!(f, "isinst {:?}", ty),
            NewObj(method) => write!(f, "newobj {:?}", method),
            Call(method) => write!(f, "call {:?}", method),
            CallVirt(method) => write!(f, "callvirt {:?}", method),
            Constrained(ty) => write!(f, "constrained. {:?}", ty),
            LdFtn(method) => write!(f, "ldftn {:?}", method),
            LdVirtFtn(method) => write!(f, "ldvirtftn {:?}", method),
            SizeOf(ty) => write!(f, "sizeof {:?}", ty),
        }
    }
}

impl<Lbl: fmt::Debug> fmt::Display for BranchInstruction<Lbl> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchInstruction::Br(lbl) => write!(f, "br {:?}", lbl),
            BranchInstruction::BrTrue(lbl) => write!(f, "brtrue {:?}", lbl),
            BranchInstruction::BrFalse(lbl) => write!(f, "brfalse {:?}", lbl),
            BranchInstruction::BranchIf(cmp, lbl) => write!(f, "{} {:?}", cmp.mnemonic(), lbl),
            BranchInstruction::Switch(lbls) => write!(f, "switch {:?}", lbls),
            BranchInstruction::Leave(lbl) => write!(f, "leave {:?}", lbl),
            BranchInstruction::Ret => f.write_str("ret"),
            BranchInstruction::Throw => f.write_str("throw"),
            BranchInstruction::Rethrow => f.write_str("rethrow"),
            BranchInstruction::EndFinally => f.write_str("endfinally"),
            BranchInstruction::EndFilter => f.write_str("endfilter"),
        }
    }
}
