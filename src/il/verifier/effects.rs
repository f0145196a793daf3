//! Stack effects of every instruction
//!
//! [`stack_effect`] and [`branch_effect`] are total matches over the instruction sets: adding an
//! instruction without saying what it does to the stack is a compile error.

use super::{StackClass, TypeTag};
use crate::il::code::{BranchInstruction, Instruction};
use crate::il::type_graph::{PrimitiveType, SystemTypes, TypeGraph, TypeId};
use crate::il::VerifierErrorKind;

/// Everything about the method being built that stack effects can depend on
pub struct VerifierContext<'a, 'g> {
    pub graph: &'a TypeGraph<'g>,
    pub system: &'a SystemTypes<'g>,

    /// Argument types (including the receiver for instance methods)
    pub arguments: &'a [TypeId<'g>],

    pub locals: &'a [TypeId<'g>],

    /// `None` for `void` methods
    pub return_type: Option<TypeId<'g>>,

    /// Type from a `constrained.` prefix immediately preceding this instruction
    pub constrained: Option<TypeId<'g>>,
}

impl<'a, 'g> VerifierContext<'a, 'g> {
    fn argument(&self, index: u16) -> Result<TypeId<'g>, VerifierErrorKind> {
        self.arguments
            .get(index as usize)
            .copied()
            .ok_or(VerifierErrorKind::InvalidIndex(index))
    }

    fn local(&self, index: u16) -> Result<TypeId<'g>, VerifierErrorKind> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(VerifierErrorKind::InvalidIndex(index))
    }

    fn tag(&self, primitive: PrimitiveType) -> TypeTag<'g> {
        TypeTag::Value(self.system.primitive(primitive))
    }
}

/// What an instruction requires of one stack slot it pops
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expect<'g> {
    Any,

    /// `int32` (eg. `switch`)
    Integer32,

    /// `int32` or native int (array indices and lengths)
    Index,

    /// Any integer
    Integer,

    /// Any integer or float
    Numeric,

    /// Anything that can be tested for zero/null
    TruthValue,

    /// Object reference or `null`
    Reference,

    /// Value assignable to the given tag
    Assignable(TypeTag<'g>),

    /// Managed address of a location of the given type
    Address(TypeId<'g>),

    /// Receiver of an instance member declared on the given type (value types need an address)
    Receiver(TypeId<'g>),

    /// Like [`Expect::Receiver`], but a value type can also be passed by value (`ldfld`)
    Instance(TypeId<'g>),

    /// Array whose element type is the given type
    ArrayOf(TypeId<'g>),

    /// Any array
    Array,
}

impl<'g> Expect<'g> {
    /// Check a popped slot against the expectation
    pub fn check(&self, found: &TypeTag<'g>) -> Result<(), VerifierErrorKind> {
        let class = found.stack_class();
        let ok = match self {
            Expect::Any => true,
            Expect::Integer32 => class == StackClass::Int32,
            Expect::Index => matches!(class, StackClass::Int32 | StackClass::NativeInt),
            Expect::Integer => matches!(
                class,
                StackClass::Int32 | StackClass::Int64 | StackClass::NativeInt
            ),
            Expect::Numeric => matches!(
                class,
                StackClass::Int32 | StackClass::Int64 | StackClass::NativeInt | StackClass::Float
            ),
            Expect::TruthValue => !matches!(class, StackClass::Float | StackClass::ValueType),
            Expect::Reference => class == StackClass::Object,
            Expect::Assignable(expected) => found.is_assignable(expected),
            Expect::Address(referent) => found.is_assignable(&TypeTag::Address(*referent)),
            Expect::Receiver(owner) => is_receiver(found, *owner),
            Expect::Instance(owner) => {
                is_receiver(found, *owner) || found == &TypeTag::Value(*owner)
            }
            Expect::ArrayOf(element) => match found {
                TypeTag::Null => true,
                TypeTag::Value(array) => match array.element_type() {
                    Some(found_element) => {
                        TypeTag::Value(found_element).is_assignable(&TypeTag::Value(*element))
                            && found_element.is_value_type() == element.is_value_type()
                    }
                    None => false,
                },
                TypeTag::Address(_) => false,
            },
            Expect::Array => match found {
                TypeTag::Null => true,
                TypeTag::Value(array) => array.element_type().is_some(),
                TypeTag::Address(_) => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(VerifierErrorKind::IncompatibleOperand {
                expected: self.describe(),
                found: found.name(),
            })
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Expect::Any => String::from("any value"),
            Expect::Integer32 => String::from("int32"),
            Expect::Index => String::from("int32 or native int"),
            Expect::Integer => String::from("integer"),
            Expect::Numeric => String::from("numeric value"),
            Expect::TruthValue => String::from("integer, reference, or address"),
            Expect::Reference => String::from("object reference"),
            Expect::Assignable(tag) => tag.name(),
            Expect::Address(referent) => format!("{}&", referent.name),
            Expect::Receiver(owner) | Expect::Instance(owner) => {
                format!("receiver of type {}", owner.name)
            }
            Expect::ArrayOf(element) => format!("{}[]", element.name),
            Expect::Array => String::from("array"),
        }
    }
}

/// Reference receivers are passed as objects, value type receivers by address
fn is_receiver<'g>(found: &TypeTag<'g>, owner: TypeId<'g>) -> bool {
    if owner.is_value_type() {
        found.is_assignable(&TypeTag::Address(owner))
    } else {
        found.is_assignable(&TypeTag::Value(owner))
    }
}

/// What an instruction pushes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Produce<'g> {
    Type(TypeTag<'g>),

    /// Same type as the popped operand at this position (0 is the top of the stack)
    Popped(usize),

    /// Result type of the [`PairRule`] check
    Arithmetic,
}

/// Extra constraint between the two operands of a binary instruction
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PairRule {
    /// Numeric operands of compatible stack classes
    Arithmetic {
        /// Allow address arithmetic (`add`, `sub`)
        addresses: bool,

        /// Allow floating point operands
        floats: bool,
    },

    /// Operands that can be compared with each other
    Comparison,
}

impl PairRule {
    /// Check the operands (`left` was pushed before `right`) and compute the result type
    pub fn result<'g>(
        &self,
        left: &TypeTag<'g>,
        right: &TypeTag<'g>,
        system: &SystemTypes<'g>,
    ) -> Result<TypeTag<'g>, VerifierErrorKind> {
        use StackClass::*;

        let result = match self {
            PairRule::Arithmetic { addresses, floats } => {
                match (left.stack_class(), right.stack_class()) {
                    (Int32, Int32) | (Int64, Int64) | (NativeInt, NativeInt) if left == right => {
                        Some(*left)
                    }
                    (Int32, Int32) => Some(TypeTag::Value(system.int32)),
                    (Int64, Int64) => Some(TypeTag::Value(system.int64)),
                    (NativeInt, NativeInt) => Some(TypeTag::Value(system.intptr)),
                    (Int32, NativeInt) => Some(*right),
                    (NativeInt, Int32) => Some(*left),
                    (Float, Float) if *floats => {
                        if left == right {
                            Some(*left)
                        } else {
                            Some(TypeTag::Value(system.double))
                        }
                    }
                    (Address, Int32 | NativeInt) if *addresses => Some(*left),
                    (Int32 | NativeInt, Address) if *addresses => Some(*right),
                    (Address, Address) if *addresses => Some(TypeTag::Value(system.intptr)),
                    _ => None,
                }
            }
            PairRule::Comparison => match (left.stack_class(), right.stack_class()) {
                (Int32 | NativeInt, Int32 | NativeInt)
                | (Int64, Int64)
                | (Float, Float)
                | (Object, Object)
                | (Address, Address)
                | (Address, NativeInt)
                | (NativeInt, Address) => Some(TypeTag::Value(system.int32)),
                _ => None,
            },
        };

        result.ok_or_else(|| VerifierErrorKind::IncompatibleOperand {
            expected: String::from("operands of compatible numeric types"),
            found: format!("{}, {}", left, right),
        })
    }
}

/// Stack effect of one instruction
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StackEffect<'g> {
    /// Popped operands, starting from the top of the stack
    pub pops: Vec<Expect<'g>>,

    /// Pushed results, in the order they are pushed
    pub pushes: Vec<Produce<'g>>,

    /// Constraint on the top two popped operands
    pub pair: Option<PairRule>,
}

impl<'g> StackEffect<'g> {
    fn new(pops: Vec<Expect<'g>>, pushes: Vec<Produce<'g>>) -> Self {
        StackEffect {
            pops,
            pushes,
            pair: None,
        }
    }

    fn push(tag: TypeTag<'g>) -> Self {
        StackEffect::new(vec![], vec![Produce::Type(tag)])
    }

    fn pop(expect: Expect<'g>) -> Self {
        StackEffect::new(vec![expect], vec![])
    }

    fn binary(pair: PairRule, pushes: Vec<Produce<'g>>) -> Self {
        StackEffect {
            pops: vec![Expect::Any, Expect::Any],
            pushes,
            pair: Some(pair),
        }
    }
}

/// Stack effect of a non-branching instruction
pub fn stack_effect<'g>(
    insn: &Instruction<'g>,
    ctx: &VerifierContext<'_, 'g>,
) -> Result<StackEffect<'g>, VerifierErrorKind> {
    use Instruction::*;

    let integer_arithmetic = PairRule::Arithmetic {
        addresses: false,
        floats: false,
    };
    let int32 = TypeTag::Value(ctx.system.int32);

    let effect = match insn {
        Nop | Constrained(_) => StackEffect::default(),

        LdArg(idx) => StackEffect::push(TypeTag::of(ctx.argument(*idx)?)),
        LdArgA(idx) => StackEffect::push(TypeTag::Address(ctx.argument(*idx)?)),
        StArg(idx) => StackEffect::pop(Expect::Assignable(TypeTag::of(ctx.argument(*idx)?))),
        LdLoc(idx) => StackEffect::push(TypeTag::of(ctx.local(*idx)?)),
        LdLocA(idx) => StackEffect::push(TypeTag::Address(ctx.local(*idx)?)),
        StLoc(idx) => StackEffect::pop(Expect::Assignable(TypeTag::of(ctx.local(*idx)?))),

        LdNull => StackEffect::push(TypeTag::Null),
        LdcI4(_) => StackEffect::push(int32),
        LdcI8(_) => StackEffect::push(ctx.tag(PrimitiveType::I64)),
        LdcR4(_) => StackEffect::push(ctx.tag(PrimitiveType::F32)),
        LdcR8(_) => StackEffect::push(ctx.tag(PrimitiveType::F64)),
        LdStr(_) => StackEffect::push(TypeTag::Value(ctx.system.string)),

        Dup => StackEffect::new(
            vec![Expect::Any],
            vec![Produce::Popped(0), Produce::Popped(0)],
        ),
        Pop => StackEffect::pop(Expect::Any),

        Add | Sub => StackEffect::binary(
            PairRule::Arithmetic {
                addresses: true,
                floats: true,
            },
            vec![Produce::Arithmetic],
        ),
        Mul | Div | Rem => StackEffect::binary(
            PairRule::Arithmetic {
                addresses: false,
                floats: true,
            },
            vec![Produce::Arithmetic],
        ),
        DivUn | RemUn | And | Or | Xor | AddOvf | AddOvfUn | SubOvf | SubOvfUn | MulOvf
        | MulOvfUn => StackEffect::binary(integer_arithmetic, vec![Produce::Arithmetic]),

        // The shift amount is on top, the value being shifted is below it
        Shl | Shr | ShrUn => StackEffect::new(
            vec![Expect::Integer, Expect::Integer],
            vec![Produce::Popped(1)],
        ),
        Neg => StackEffect::new(vec![Expect::Numeric], vec![Produce::Popped(0)]),
        Not => StackEffect::new(vec![Expect::Integer], vec![Produce::Popped(0)]),

        Ceq | Cgt | CgtUn | Clt | CltUn => {
            StackEffect::binary(PairRule::Comparison, vec![Produce::Type(int32)])
        }

        Conv { to, checked, .. } => {
            if matches!(to, PrimitiveType::Boolean | PrimitiveType::Char) {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "conversion target must be a numeric type",
                ));
            }
            if *checked && to.is_float() {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "there are no overflow-checked conversions to floats",
                ));
            }
            StackEffect::new(vec![Expect::Numeric], vec![Produce::Type(ctx.tag(*to))])
        }

        LdFld(field) | LdFldA(field) | StFld(field) if field.is_static() => {
            return Err(VerifierErrorKind::InvalidInstruction(
                "instance field access to a static field",
            ))
        }
        LdSFld(field) | LdSFldA(field) | StSFld(field) if !field.is_static() => {
            return Err(VerifierErrorKind::InvalidInstruction(
                "static field access to an instance field",
            ))
        }
        LdFld(field) => StackEffect::new(
            vec![Expect::Instance(field.owner)],
            vec![Produce::Type(TypeTag::of(field.field_type))],
        ),
        LdFldA(field) => StackEffect::new(
            vec![Expect::Receiver(field.owner)],
            vec![Produce::Type(TypeTag::Address(field.field_type))],
        ),
        StFld(field) => StackEffect::new(
            vec![
                Expect::Assignable(TypeTag::of(field.field_type)),
                Expect::Receiver(field.owner),
            ],
            vec![],
        ),
        LdSFld(field) => StackEffect::push(TypeTag::of(field.field_type)),
        LdSFldA(field) => StackEffect::push(TypeTag::Address(field.field_type)),
        StSFld(field) => StackEffect::pop(Expect::Assignable(TypeTag::of(field.field_type))),

        LdElem(element) => StackEffect::new(
            vec![Expect::Index, Expect::ArrayOf(*element)],
            vec![Produce::Type(TypeTag::of(*element))],
        ),
        LdElemA(element) => StackEffect::new(
            vec![Expect::Index, Expect::ArrayOf(*element)],
            vec![Produce::Type(TypeTag::Address(*element))],
        ),
        StElem(element) => StackEffect::new(
            vec![
                Expect::Assignable(TypeTag::of(*element)),
                Expect::Index,
                Expect::ArrayOf(*element),
            ],
            vec![],
        ),
        LdLen => StackEffect::new(
            vec![Expect::Array],
            vec![Produce::Type(ctx.tag(PrimitiveType::UIntPtr))],
        ),
        NewArr(element) => StackEffect::new(
            vec![Expect::Index],
            vec![Produce::Type(TypeTag::Value(ctx.graph.array_of(*element)))],
        ),

        LdInd(ty) | StInd(ty) if ty.is_struct() => {
            return Err(VerifierErrorKind::InvalidInstruction(
                "indirect access to a value type needs `ldobj`/`stobj`",
            ))
        }
        LdInd(ty) => StackEffect::new(
            vec![Expect::Address(*ty)],
            vec![Produce::Type(TypeTag::of(*ty))],
        ),
        StInd(ty) => StackEffect::new(
            vec![Expect::Assignable(TypeTag::of(*ty)), Expect::Address(*ty)],
            vec![],
        ),
        LdObj(ty) => StackEffect::new(
            vec![Expect::Address(*ty)],
            vec![Produce::Type(TypeTag::Value(*ty))],
        ),
        StObj(ty) => StackEffect::new(
            vec![Expect::Assignable(TypeTag::Value(*ty)), Expect::Address(*ty)],
            vec![],
        ),
        InitObj(ty) => StackEffect::pop(Expect::Address(*ty)),

        Box(ty) => {
            let boxed = if ty.is_value_type() {
                ctx.system.object
            } else {
                *ty
            };
            StackEffect::new(
                vec![Expect::Assignable(TypeTag::of(*ty))],
                vec![Produce::Type(TypeTag::Value(boxed))],
            )
        }
        Unbox(ty) => {
            if !ty.is_value_type() {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "`unbox` needs a value type",
                ));
            }
            StackEffect::new(
                vec![Expect::Reference],
                vec![Produce::Type(TypeTag::Address(*ty))],
            )
        }
        UnboxAny(ty) => StackEffect::new(
            vec![Expect::Reference],
            vec![Produce::Type(TypeTag::of(*ty))],
        ),
        CastClass(ty) | IsInst(ty) => StackEffect::new(
            vec![Expect::Reference],
            vec![Produce::Type(TypeTag::Value(*ty))],
        ),

        NewObj(method) => {
            if !method.is_constructor() || method.is_static() {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "`newobj` needs an instance constructor",
                ));
            }
            StackEffect::new(
                arguments(&method.parameters),
                vec![Produce::Type(TypeTag::Value(method.owner))],
            )
        }
        Call(method) | CallVirt(method) => {
            let is_virtual_call = matches!(insn, CallVirt(_));
            if is_virtual_call && method.is_static() {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "`callvirt` needs an instance method",
                ));
            }
            let mut pops = arguments(&method.parameters);
            if !method.is_static() {
                match ctx.constrained {
                    Some(constrained) if is_virtual_call => pops.push(Expect::Address(constrained)),
                    _ => pops.push(Expect::Receiver(method.owner)),
                }
            }
            let pushes = method
                .return_type
                .map(|ret| Produce::Type(TypeTag::of(ret)))
                .into_iter()
                .collect();
            StackEffect::new(pops, pushes)
        }

        LdFtn(_) => StackEffect::push(ctx.tag(PrimitiveType::IntPtr)),
        LdVirtFtn(method) => {
            if method.is_static() {
                return Err(VerifierErrorKind::InvalidInstruction(
                    "`ldvirtftn` needs an instance method",
                ));
            }
            StackEffect::new(
                vec![Expect::Receiver(method.owner)],
                vec![Produce::Type(ctx.tag(PrimitiveType::IntPtr))],
            )
        }
        SizeOf(_) => StackEffect::push(ctx.tag(PrimitiveType::U32)),
    };

    Ok(effect)
}

/// Arguments are popped in reverse order (the last argument is on top)
fn arguments<'g>(parameters: &[TypeId<'g>]) -> Vec<Expect<'g>> {
    parameters
        .iter()
        .rev()
        .map(|param| Expect::Assignable(TypeTag::of(*param)))
        .collect()
}

/// Stack effect of a branching instruction, not including the effect on reachability
pub fn branch_effect<'g, Lbl>(
    insn: &BranchInstruction<Lbl>,
    ctx: &VerifierContext<'_, 'g>,
) -> Result<StackEffect<'g>, VerifierErrorKind> {
    let effect = match insn {
        BranchInstruction::Br(_)
        | BranchInstruction::Leave(_)
        | BranchInstruction::Rethrow
        | BranchInstruction::EndFinally => StackEffect::default(),
        BranchInstruction::BrTrue(_) | BranchInstruction::BrFalse(_) => {
            StackEffect::pop(Expect::TruthValue)
        }
        BranchInstruction::BranchIf(_, _) => StackEffect::binary(PairRule::Comparison, vec![]),
        BranchInstruction::Switch(_) | BranchInstruction::EndFilter => {
            StackEffect::pop(Expect::Integer32)
        }
        BranchInstruction::Ret => match ctx.return_type {
            Some(return_type) => StackEffect::pop(Expect::Assignable(TypeTag::of(return_type))),
            None => StackEffect::default(),
        },
        BranchInstruction::Throw => StackEffect::pop(Expect::Reference),
    };
    Ok(effect)
}
