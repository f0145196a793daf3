use super::{BranchInstruction, BytecodeSink, CodeBuilder, Comparison, Instruction, Label, Local};
use crate::il::type_graph::{FieldId, MethodId, PrimitiveType, TypeId};
use crate::il::verifier::Signedness;
use crate::il::{Error, VerifierErrorKind};

/// Typed emission helpers
///
/// These pick the right variant of an instruction from what is currently on the stack (signed
/// versus unsigned arithmetic, direct versus constrained calls, etc.), so callers only have to say
/// what they want done.
pub trait CodeBuilderExts<'g> {
    /// Push an integer constant onto the stack
    fn const_int(&mut self, integer: i32) -> Result<(), Error>;

    /// Push a long constant onto the stack
    ///
    /// Longs that fit in an `int32` are pushed as an `int32` and then widened. Consider pushing
    /// the long 2:
    ///
    ///   * `ldc.i8 2` is 9 bytes
    ///   * `ldc.i4.2 conv.i8` is 2 bytes
    ///
    fn const_long(&mut self, long: i64) -> Result<(), Error>;

    /// Push a constant string onto the stack
    fn const_string(&mut self, string: impl Into<String>) -> Result<(), Error>;

    fn get_local(&mut self, local: Local) -> Result<(), Error>;

    fn set_local(&mut self, local: Local) -> Result<(), Error>;

    /// Divide the top two values (`div` or `div.un`, depending on the dividend)
    fn divide(&mut self) -> Result<(), Error>;

    /// Remainder of the top two values (`rem` or `rem.un`, depending on the dividend)
    fn remainder(&mut self) -> Result<(), Error>;

    /// Shift right (`shr` or `shr.un`, depending on the value being shifted)
    fn shift_right(&mut self) -> Result<(), Error>;

    /// Push 1 if the second value is less than the top value (0 otherwise)
    fn compare_less(&mut self) -> Result<(), Error>;

    /// Push 1 if the second value is greater than the top value (0 otherwise)
    fn compare_greater(&mut self) -> Result<(), Error>;

    /// Compare the top two values and jump if the comparison holds
    fn branch_if(&mut self, comparison: CompareOp, label: Label) -> Result<(), Error>;

    /// Convert the top of the stack, treating it as unsigned if its type is unsigned
    fn convert(&mut self, to: PrimitiveType, checked: bool) -> Result<(), Error>;

    /// Load an array element
    ///
    /// Structs are loaded through their address (`ldelema` then `ldobj`).
    fn load_element(&mut self, element_type: TypeId<'g>) -> Result<(), Error>;

    fn store_element(&mut self, element_type: TypeId<'g>) -> Result<(), Error>;

    /// Load through an address (`ldind.*`, or `ldobj` for structs)
    fn load_indirect(&mut self, referent: TypeId<'g>) -> Result<(), Error>;

    /// Store through an address (`stind.*`, or `stobj` for structs)
    fn store_indirect(&mut self, referent: TypeId<'g>) -> Result<(), Error>;

    /// Get/put a field
    fn access_field(&mut self, field: FieldId<'g>, access_mode: AccessMode) -> Result<(), Error>;

    /// Call a method without virtual dispatch
    fn call(&mut self, method: MethodId<'g>) -> Result<(), Error>;

    /// Call an instance method on a receiver of the given type
    ///
    /// Without the receiver type, there is no way to pick the dispatch, so `None` is an error.
    /// Value type receivers (passed by address) use a `constrained.` call, sealed receivers
    /// calling their own methods and non-virtual methods use a direct `call`, and everything else
    /// uses `callvirt`.
    fn call_virtual(
        &mut self,
        method: MethodId<'g>,
        receiver: Option<TypeId<'g>>,
    ) -> Result<(), Error>;

    /// Construct a new object
    fn new_object(&mut self, constructor: MethodId<'g>) -> Result<(), Error>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Comparisons that don't say anything about signedness
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

/// Signedness of the value `depth` slots below the top of the stack
///
/// In unreachable code nothing is checked, so any variant will do.
fn operand_signedness<'g, S: BytecodeSink<'g>>(
    builder: &CodeBuilder<'g, S>,
    depth: usize,
    instruction: &str,
) -> Result<Signedness, Error> {
    let stack = builder.current_stack();
    let available = match stack.len() {
        None => return Ok(Signedness::Signed),
        Some(len) => len,
    };
    let tag = stack.peek(depth).ok_or_else(|| Error::Verifier {
        instruction: instruction.to_owned(),
        kind: VerifierErrorKind::StackUnderflow {
            required: depth + 1,
            available,
        },
    })?;
    tag.signedness().ok_or_else(|| Error::Verifier {
        instruction: instruction.to_owned(),
        kind: VerifierErrorKind::UnsupportedOperandType(tag.name()),
    })
}

impl<'g, S: BytecodeSink<'g>> CodeBuilderExts<'g> for CodeBuilder<'g, S> {
    fn const_int(&mut self, integer: i32) -> Result<(), Error> {
        self.push_instruction(Instruction::LdcI4(integer))
    }

    fn const_long(&mut self, long: i64) -> Result<(), Error> {
        match i32::try_from(long) {
            Ok(integer) => {
                self.push_instruction(Instruction::LdcI4(integer))?;
                self.push_instruction(Instruction::Conv {
                    to: PrimitiveType::I64,
                    checked: false,
                    unsigned_source: false,
                })
            }
            Err(_) => self.push_instruction(Instruction::LdcI8(long)),
        }
    }

    fn const_string(&mut self, string: impl Into<String>) -> Result<(), Error> {
        self.push_instruction(Instruction::LdStr(string.into()))
    }

    fn get_local(&mut self, local: Local) -> Result<(), Error> {
        self.push_instruction(Instruction::LdLoc(local.index()))
    }

    fn set_local(&mut self, local: Local) -> Result<(), Error> {
        self.push_instruction(Instruction::StLoc(local.index()))
    }

    fn divide(&mut self) -> Result<(), Error> {
        let insn = match operand_signedness(self, 1, "div")? {
            Signedness::Signed => Instruction::Div,
            Signedness::Unsigned => Instruction::DivUn,
        };
        self.push_instruction(insn)
    }

    fn remainder(&mut self) -> Result<(), Error> {
        let insn = match operand_signedness(self, 1, "rem")? {
            Signedness::Signed => Instruction::Rem,
            Signedness::Unsigned => Instruction::RemUn,
        };
        self.push_instruction(insn)
    }

    fn shift_right(&mut self) -> Result<(), Error> {
        let insn = match operand_signedness(self, 1, "shr")? {
            Signedness::Signed => Instruction::Shr,
            Signedness::Unsigned => Instruction::ShrUn,
        };
        self.push_instruction(insn)
    }

    fn compare_less(&mut self) -> Result<(), Error> {
        let insn = match operand_signedness(self, 1, "clt")? {
            Signedness::Signed => Instruction::Clt,
            Signedness::Unsigned => Instruction::CltUn,
        };
        self.push_instruction(insn)
    }

    fn compare_greater(&mut self) -> Result<(), Error> {
        let insn = match operand_signedness(self, 1, "cgt")? {
            Signedness::Signed => Instruction::Cgt,
            Signedness::Unsigned => Instruction::CgtUn,
        };
        self.push_instruction(insn)
    }

    fn branch_if(&mut self, comparison: CompareOp, label: Label) -> Result<(), Error> {
        // Equality doesn't care about signedness (and works on references too)
        let comparison = match comparison {
            CompareOp::Equal => Comparison::Eq,
            CompareOp::NotEqual => Comparison::NeUn,
            ordered => {
                let unsigned = operand_signedness(self, 1, "conditional branch")?
                    == Signedness::Unsigned;
                match (ordered, unsigned) {
                    (CompareOp::Less, false) => Comparison::Lt,
                    (CompareOp::Less, true) => Comparison::LtUn,
                    (CompareOp::LessOrEqual, false) => Comparison::Le,
                    (CompareOp::LessOrEqual, true) => Comparison::LeUn,
                    (CompareOp::Greater, false) => Comparison::Gt,
                    (CompareOp::Greater, true) => Comparison::GtUn,
                    (CompareOp::GreaterOrEqual, false) => Comparison::Ge,
                    (CompareOp::GreaterOrEqual, true) => Comparison::GeUn,
                    (CompareOp::Equal, _) => Comparison::Eq,
                    (CompareOp::NotEqual, _) => Comparison::NeUn,
                }
            }
        };
        self.push_branch_instruction(BranchInstruction::BranchIf(comparison, label))
    }

    fn convert(&mut self, to: PrimitiveType, checked: bool) -> Result<(), Error> {
        let unsigned_source = operand_signedness(self, 0, "conv")? == Signedness::Unsigned;
        self.push_instruction(Instruction::Conv {
            to,
            checked,
            unsigned_source,
        })
    }

    fn load_element(&mut self, element_type: TypeId<'g>) -> Result<(), Error> {
        if element_type.is_struct() {
            self.push_instruction(Instruction::LdElemA(element_type))?;
            self.push_instruction(Instruction::LdObj(element_type))
        } else {
            self.push_instruction(Instruction::LdElem(element_type))
        }
    }

    fn store_element(&mut self, element_type: TypeId<'g>) -> Result<(), Error> {
        self.push_instruction(Instruction::StElem(element_type))
    }

    fn load_indirect(&mut self, referent: TypeId<'g>) -> Result<(), Error> {
        if referent.is_struct() {
            self.push_instruction(Instruction::LdObj(referent))
        } else {
            self.push_instruction(Instruction::LdInd(referent))
        }
    }

    fn store_indirect(&mut self, referent: TypeId<'g>) -> Result<(), Error> {
        if referent.is_struct() {
            self.push_instruction(Instruction::StObj(referent))
        } else {
            self.push_instruction(Instruction::StInd(referent))
        }
    }

    fn access_field(&mut self, field: FieldId<'g>, access_mode: AccessMode) -> Result<(), Error> {
        let insn = match (field.is_static(), access_mode) {
            (true, AccessMode::Read) => Instruction::LdSFld(field),
            (true, AccessMode::Write) => Instruction::StSFld(field),
            (false, AccessMode::Read) => Instruction::LdFld(field),
            (false, AccessMode::Write) => Instruction::StFld(field),
        };
        self.push_instruction(insn)
    }

    fn call(&mut self, method: MethodId<'g>) -> Result<(), Error> {
        self.push_instruction(Instruction::Call(method))
    }

    fn call_virtual(
        &mut self,
        method: MethodId<'g>,
        receiver: Option<TypeId<'g>>,
    ) -> Result<(), Error> {
        let receiver = receiver.ok_or_else(|| Error::Verifier {
            instruction: Instruction::CallVirt(method).to_string(),
            kind: VerifierErrorKind::MissingOperandContext("receiver type of a virtual call"),
        })?;

        if receiver.is_value_type() && method.is_virtual() {
            self.push_instruction(Instruction::Constrained(receiver))?;
            self.push_instruction(Instruction::CallVirt(method))
        } else if !method.is_virtual() || (receiver.is_sealed() && method.owner == receiver) {
            self.push_instruction(Instruction::Call(method))
        } else {
            self.push_instruction(Instruction::CallVirt(method))
        }
    }

    fn new_object(&mut self, constructor: MethodId<'g>) -> Result<(), Error> {
        self.push_instruction(Instruction::NewObj(constructor))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::code::{RecordingSink, SinkEvent};
    use crate::il::type_graph::{TypeGraph, TypeGraphArenas};
    use crate::il::verifier::{AbstractStack, TypeTag};
    use crate::il::{MethodFlags, TypeFlags};

    #[test]
    fn signed_and_unsigned_variants() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let class = graph.add_class("Test.Program", system.object, TypeFlags::PUBLIC);
        let method = graph.add_method(
            class,
            "Run",
            vec![system.uint32, system.int32, system.uint64],
            None,
            MethodFlags::PUBLIC | MethodFlags::STATIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());

        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.const_int(3).unwrap();
        builder.divide().unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        builder.const_int(3).unwrap();
        builder.remainder().unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        builder.push_instruction(Instruction::LdArg(2)).unwrap();
        builder.const_int(1).unwrap();
        builder.shift_right().unwrap();
        builder.convert(PrimitiveType::F64, false).unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.compare_less().unwrap();
        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        builder.compare_greater().unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();
        let code = builder.finish().unwrap();
        assert_eq!(
            code.sink.instructions(),
            vec![
                "ldarg 0",
                "ldc.i4 3",
                "div.un",
                "pop",
                "ldarg 1",
                "ldc.i4 3",
                "rem",
                "pop",
                "ldarg 2",
                "ldc.i4 1",
                "shr.un",
                "conv.r.un (to r8)",
                "pop",
                "ldarg 0",
                "ldarg 0",
                "clt.un",
                "ldarg 1",
                "cgt",
                "pop",
                "ret",
            ]
        );
    }

    #[test]
    fn unsupported_operands() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let class = graph.add_class("Test.Program", system.object, TypeFlags::PUBLIC);
        let method = graph.add_method(
            class,
            "Run",
            vec![],
            None,
            MethodFlags::PUBLIC | MethodFlags::STATIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        builder.const_string("a").unwrap();
        builder.const_string("b").unwrap();
        assert!(matches!(
            builder.divide(),
            Err(Error::Verifier {
                kind: VerifierErrorKind::UnsupportedOperandType(ref name),
                ..
            }) if name == "System.String"
        ));
        builder.push_instruction(Instruction::Pop).unwrap();
        assert!(matches!(
            builder.compare_less(),
            Err(Error::Verifier {
                kind: VerifierErrorKind::StackUnderflow {
                    required: 2,
                    available: 1
                },
                ..
            })
        ));

        // Dead code gets the signed variant without any checks
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();
        builder.divide().unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn struct_accesses_go_through_addresses() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let point = graph.add_value_type("Test.Point", system.value_type, TypeFlags::PUBLIC);
        let points = graph.array_of(point);
        let class = graph.add_class("Test.Program", system.object, TypeFlags::PUBLIC);
        let method = graph.add_method(
            class,
            "First",
            vec![points],
            Some(point),
            MethodFlags::PUBLIC | MethodFlags::STATIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.const_int(0).unwrap();
        builder.load_element(point).unwrap();
        assert_eq!(
            builder.current_stack(),
            &AbstractStack::Reachable(vec![TypeTag::Value(point)])
        );
        let copy = builder.declare_local(point).unwrap();
        builder.set_local(copy).unwrap();
        builder
            .push_instruction(Instruction::LdLocA(copy.index()))
            .unwrap();
        builder.load_indirect(point).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        assert_eq!(
            code.sink.instructions(),
            vec![
                "ldarg 0",
                "ldc.i4 0",
                "ldelema Test.Point",
                "ldobj Test.Point",
                "stloc 0",
                "ldloca 0",
                "ldobj Test.Point",
                "ret",
            ]
        );
    }

    #[test]
    fn call_dispatch() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let to_string = graph.add_method(
            system.object,
            "ToString",
            vec![],
            Some(system.string),
            MethodFlags::PUBLIC | MethodFlags::VIRTUAL,
        );
        let sealed = graph.add_class(
            "Test.Sealed",
            system.object,
            TypeFlags::PUBLIC | TypeFlags::SEALED,
        );
        let describe = graph.add_method(
            sealed,
            "Describe",
            vec![],
            Some(system.string),
            MethodFlags::PUBLIC | MethodFlags::VIRTUAL,
        );
        let point = graph.add_value_type("Test.Point", system.value_type, TypeFlags::PUBLIC);
        let method = graph.add_method(
            point,
            "Run",
            vec![sealed],
            None,
            MethodFlags::PUBLIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());

        // Value type receiver
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.call_virtual(to_string, Some(point)).unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        // Sealed receiver calling its own method
        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        builder.call_virtual(describe, Some(sealed)).unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        // Inherited virtual method
        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        builder.call_virtual(to_string, Some(sealed)).unwrap();
        builder.push_instruction(Instruction::Pop).unwrap();

        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        assert!(matches!(
            builder.call_virtual(to_string, None),
            Err(Error::Verifier {
                kind: VerifierErrorKind::MissingOperandContext(_),
                ..
            })
        ));
        builder.push_instruction(Instruction::Pop).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        let calls: Vec<&SinkEvent> = code
            .sink
            .events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    SinkEvent::Instruction(
                        Instruction::Call(_)
                            | Instruction::CallVirt(_)
                            | Instruction::Constrained(_)
                    )
                )
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                &SinkEvent::Instruction(Instruction::Constrained(point)),
                &SinkEvent::Instruction(Instruction::CallVirt(to_string)),
                &SinkEvent::Instruction(Instruction::Call(describe)),
                &SinkEvent::Instruction(Instruction::CallVirt(to_string)),
            ]
        );
    }

    #[test]
    fn constants_and_branches() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let class = graph.add_class("Test.Program", system.object, TypeFlags::PUBLIC);
        let method = graph.add_method(
            class,
            "Run",
            vec![system.uint64],
            Some(system.int64),
            MethodFlags::PUBLIC | MethodFlags::STATIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        let small = builder.define_label();
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.const_long(10).unwrap();
        builder.branch_if(CompareOp::Less, small).unwrap();
        builder.const_long(1 << 40).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();
        builder.mark_label(small).unwrap();
        builder.const_long(-1).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        assert_eq!(
            code.sink.instructions(),
            vec![
                "ldarg 0",
                "ldc.i4 10",
                "conv.i8",
                "blt.un L0",
                "ldc.i8 1099511627776",
                "ret",
                "ldc.i4 -1",
                "conv.i8",
                "ret",
            ]
        );
    }
}
