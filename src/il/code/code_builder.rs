use super::{
    BranchInstruction, BytecodeSink, Instruction, InstructionRecord, Label, LabelTable,
    RecordedInstruction, Region, RegionKind, RegionTracker,
};
use crate::il::type_graph::{MethodId, SystemTypes, TypeGraph, TypeId};
use crate::il::verifier::{AbstractStack, TypeTag, VerifierContext};
use crate::il::{Error, VerifierErrorKind};

/// This provides the interface for building up a method body one instruction at a time. It does
/// internal bookkeeping to track the operand stack, labels, reachability, and exception regions,
/// and only forwards an instruction to the sink once it has been verified.
///
/// ### Stacks at labels
///
/// Working out the stack at a merge point normally means merging the stacks of all incoming edges
/// and propagating the result, which is a fixpoint computation. We avoid this: the first edge to
/// reach a label (a branch, or the fall through when the label is placed) records the stack, and
/// every other edge must be assignable to it. Code generators rarely rely on merging to a common
/// supertype, so this only rejects code that could be made to verify by widening one branch.
///
/// ### Tracking reachability
///
/// After an instruction that doesn't fall through, the stack is `Unreachable` until the next
/// label which something has jumped to. Instructions emitted in unreachable code are forwarded to
/// the sink without any checks (they are dead, so they can't break anything).
///
/// ### Exception regions
///
/// Control never falls out of a protected block or handler. When a region ends while its code is
/// still reachable, the builder emits the exit instruction itself (`leave`, `endfinally`, or
/// `endfilter`), and that instruction is checked like any other.
pub struct CodeBuilder<'g, S> {
    /// Type graph
    pub graph: &'g TypeGraph<'g>,

    /// Well-known types
    ///
    /// Note: this isn't just a convenience - the verifier needs to reason about some of these (eg.
    /// the result of `ldstr` or the exception in a filter).
    pub system: &'g SystemTypes<'g>,

    /// Reference to method data in the type graph
    pub method: MethodId<'g>,

    /// Where verified instructions go
    sink: S,

    /// Argument types (receiver first, for instance methods)
    arguments: Vec<TypeId<'g>>,

    locals: Vec<TypeId<'g>>,

    /// Stack before the next instruction
    stack: AbstractStack<'g>,

    labels: LabelTable<'g>,
    regions: RegionTracker<'g>,
    records: Vec<InstructionRecord<'g>>,

    /// Type of a `constrained.` prefix waiting for its `callvirt`
    constrained: Option<TypeId<'g>>,

    max_stack: usize,
}

/// Handle to a local variable declared on a [`CodeBuilder`]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Local(u16);

impl Local {
    pub fn index(self) -> u16 {
        self.0
    }
}

/// Everything left once a method body has been built
pub struct FinishedCode<'g, S> {
    pub sink: S,
    pub records: Vec<InstructionRecord<'g>>,
    pub max_stack: usize,
    pub locals: Vec<TypeId<'g>>,
}

impl<'g, S: BytecodeSink<'g>> CodeBuilder<'g, S> {
    /// Create a builder for a new method body
    pub fn new(
        graph: &'g TypeGraph<'g>,
        system: &'g SystemTypes<'g>,
        method: MethodId<'g>,
        sink: S,
    ) -> Self {
        // Value type receivers are passed by address
        let mut arguments = vec![];
        if !method.is_static() {
            let owner = method.owner;
            if owner.is_value_type() {
                arguments.push(graph.by_ref(owner));
            } else {
                arguments.push(owner);
            }
        }
        arguments.extend(method.parameters.iter().copied());

        CodeBuilder {
            graph,
            system,
            method,
            sink,
            arguments,
            locals: vec![],
            stack: AbstractStack::empty(),
            labels: LabelTable::new(),
            regions: RegionTracker::new(),
            records: vec![],
            constrained: None,
            max_stack: 0,
        }
    }

    fn context(&self) -> VerifierContext<'_, 'g> {
        VerifierContext {
            graph: self.graph,
            system: self.system,
            arguments: &self.arguments,
            locals: &self.locals,
            return_type: self.method.return_type,
            constrained: self.constrained,
        }
    }

    /// Argument types (including the receiver of an instance method)
    pub fn arguments(&self) -> &[TypeId<'g>] {
        &self.arguments
    }

    pub fn locals(&self) -> &[TypeId<'g>] {
        &self.locals
    }

    /// Add a local variable of the given type
    pub fn declare_local(&mut self, local_type: TypeId<'g>) -> Result<Local, Error> {
        let index = u16::try_from(self.locals.len()).map_err(|_| Error::Verifier {
            instruction: format!("declare local {:?}", local_type),
            kind: VerifierErrorKind::InvalidIndex(u16::MAX),
        })?;
        self.locals.push(local_type);
        Ok(Local(index))
    }

    /// Generate a fresh label
    pub fn define_label(&mut self) -> Label {
        self.labels.define()
    }

    /// Stack before the next instruction
    pub fn current_stack(&self) -> &AbstractStack<'g> {
        &self.stack
    }

    /// Stack recorded for a label, if anything has reached it yet
    pub fn lookup_stack(&self, label: Label) -> Option<&AbstractStack<'g>> {
        self.labels.recorded_stack(label)
    }

    /// Everything emitted so far, with the stack each instruction was verified against
    pub fn records(&self) -> &[InstructionRecord<'g>] {
        &self.records
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    fn update_max_stack(&mut self) {
        if let Some(len) = self.stack.len() {
            self.max_stack = self.max_stack.max(len);
        }
    }

    /// A `constrained.` prefix can only be followed by `callvirt`
    fn check_no_prefix(&self, followed_by: impl FnOnce() -> String) -> Result<(), Error> {
        match self.constrained {
            None => Ok(()),
            Some(_) => Err(Error::Verifier {
                instruction: followed_by(),
                kind: VerifierErrorKind::DanglingPrefix,
            }),
        }
    }

    /// Push a new straight-line instruction
    pub fn push_instruction(&mut self, insn: Instruction<'g>) -> Result<(), Error> {
        if !matches!(insn, Instruction::CallVirt(_)) {
            self.check_no_prefix(|| insn.to_string())?;
        }

        let stack_before = self.stack.clone();
        let mut stack = self.stack.clone();
        stack
            .apply(&insn, &self.context())
            .map_err(|kind| Error::Verifier {
                instruction: insn.to_string(),
                kind,
            })?;

        self.sink.emit(&insn)?;
        log::trace!("{:<24} // {:?}", insn.to_string(), stack_before);

        self.stack = stack;
        self.update_max_stack();
        self.constrained = match insn {
            Instruction::Constrained(ty) => Some(ty),
            _ => None,
        };
        self.records.push(InstructionRecord {
            instruction: RecordedInstruction::Straight(insn),
            stack_before,
        });
        Ok(())
    }

    /// Some branching instructions only make sense inside certain handlers
    fn check_placement(&self, insn: &BranchInstruction<Label>) -> Result<(), Error> {
        let innermost = self.regions.innermost().map(|open| open.kind);
        let valid = match insn {
            BranchInstruction::Rethrow => {
                matches!(self.regions.enclosing_handler(), Some(RegionKind::Catch(_)))
            }
            BranchInstruction::EndFinally => {
                matches!(innermost, Some(RegionKind::Finally | RegionKind::Fault))
            }
            BranchInstruction::EndFilter => matches!(innermost, Some(RegionKind::Filter)),
            BranchInstruction::Ret => innermost.is_none(),
            _ => true,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidRegionNesting(format!(
                "`{}` is not allowed in {}",
                insn,
                match innermost {
                    None => String::from("the method body itself"),
                    Some(kind) => format!("{:?}", kind),
                }
            )))
        }
    }

    /// Push a branching instruction
    ///
    /// The stack delivered to every jump target is reconciled with the stack recorded for that
    /// target. If the instruction doesn't fall through, the code after it is unreachable until the
    /// next label that something jumps to.
    pub fn push_branch_instruction(&mut self, insn: BranchInstruction<Label>) -> Result<(), Error> {
        self.check_no_prefix(|| insn.to_string())?;
        for target in insn.jump_targets() {
            self.labels.check(*target)?;
        }
        self.check_placement(&insn)?;

        let stack_before = self.stack.clone();
        let mut stack = self.stack.clone();
        let delivered = stack
            .apply_branch(&insn, &self.context())
            .map_err(|kind| Error::Verifier {
                instruction: insn.to_string(),
                kind,
            })?;

        // Every jump target must accept the stack before any of them records it
        for target in insn.jump_targets() {
            self.labels.check_edge(*target, &delivered)?;
        }

        self.sink.emit_branch(&insn)?;
        log::trace!("{:<24} // {:?}", insn.to_string(), stack_before);

        for target in insn.jump_targets() {
            self.labels.reconcile(*target, &delivered)?;
        }

        self.stack = stack;
        self.update_max_stack();
        self.records.push(InstructionRecord {
            instruction: RecordedInstruction::Branch(insn),
            stack_before,
        });
        Ok(())
    }

    /// Place a label at the current point in the code
    ///
    /// This fails if the label was already placed, or if both the fall through and some earlier
    /// branch reach the label with incompatible stacks.
    pub fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        self.check_no_prefix(|| format!("{:?}:", label))?;
        let resume = self.labels.place(label, &self.stack)?;
        self.sink.mark_label(label)?;
        log::debug!("placed {:?} (stack {:?})", label, resume);
        self.stack = resume;
        Ok(())
    }

    /// Open a protected block
    ///
    /// The block starts with whatever is currently on the stack.
    pub fn begin_try(&mut self) -> Result<Region, Error> {
        self.check_no_prefix(|| String::from(".try"))?;
        let end_label = self.labels.define();
        let region = self.regions.begin_try(end_label)?;
        self.sink.begin_region(region, RegionKind::Try, None)?;
        log::debug!("begin {:?} (stack {:?})", region, self.stack);
        Ok(region)
    }

    /// Start a `catch` handler for the innermost protected block
    ///
    /// The handler starts with just the caught exception on the stack.
    pub fn begin_catch(
        &mut self,
        try_region: Region,
        exception_type: TypeId<'g>,
    ) -> Result<Region, Error> {
        self.begin_handler(try_region, RegionKind::Catch(exception_type))
    }

    /// Start a filter block, which must be closed and followed by the `catch` handler it guards
    pub fn begin_filter(&mut self, try_region: Region) -> Result<Region, Error> {
        self.begin_handler(try_region, RegionKind::Filter)
    }

    pub fn begin_fault(&mut self, try_region: Region) -> Result<Region, Error> {
        self.begin_handler(try_region, RegionKind::Fault)
    }

    pub fn begin_finally(&mut self, try_region: Region) -> Result<Region, Error> {
        self.begin_handler(try_region, RegionKind::Finally)
    }

    fn begin_handler(&mut self, try_region: Region, kind: RegionKind<'g>) -> Result<Region, Error> {
        self.check_no_prefix(|| format!("{:?}", kind))?;
        let entry = self.regions.check_handler(try_region, kind)?;

        // The first handler ends the protected block
        if entry.ends_protected_block && self.stack.is_reachable() {
            self.push_branch_instruction(BranchInstruction::Leave(entry.end_label))?;
        }

        let region = self.regions.begin_handler(try_region, kind)?;
        self.sink.begin_region(region, kind, Some(try_region))?;

        self.stack = match kind {
            RegionKind::Catch(exception_type) => {
                AbstractStack::Reachable(vec![TypeTag::Value(exception_type)])
            }
            RegionKind::Filter => {
                AbstractStack::Reachable(vec![TypeTag::Value(self.system.exception)])
            }
            RegionKind::Try | RegionKind::Fault | RegionKind::Finally => AbstractStack::empty(),
        };
        self.update_max_stack();
        log::debug!("begin {:?} {:?} (stack {:?})", kind, region, self.stack);
        Ok(region)
    }

    /// Close the innermost open region
    ///
    /// Closing a protected block (after all of its handlers) places the label right after the whole
    /// construct, so the code that follows resumes with the empty stack delivered by `leave`.
    pub fn end_region(&mut self, region: Region) -> Result<(), Error> {
        self.check_no_prefix(|| format!("end of {:?}", region))?;
        let open = self.regions.check_end(region)?.clone();

        if open.kind.is_handler() && self.stack.is_reachable() {
            let exit = match open.kind {
                RegionKind::Try | RegionKind::Catch(_) => BranchInstruction::Leave(open.end_label),
                RegionKind::Filter => BranchInstruction::EndFilter,
                RegionKind::Fault | RegionKind::Finally => BranchInstruction::EndFinally,
            };
            self.push_branch_instruction(exit)?;
        }

        self.regions.end_region(region)?;
        self.sink.end_region(region)?;
        log::debug!("end {:?} {:?}", open.kind, region);

        if open.kind == RegionKind::Try {
            self.mark_label(open.end_label)?;
        }
        Ok(())
    }

    /// Turn the builder into the finished method body
    pub fn finish(self) -> Result<FinishedCode<'g, S>, Error> {
        if let Some(open) = self.regions.innermost() {
            return Err(Error::InvalidRegionNesting(format!(
                "{:?} ({:?}) is still open",
                open.region, open.kind
            )));
        }
        if let Some(ty) = self.constrained {
            return Err(Error::Verifier {
                instruction: Instruction::Constrained(ty).to_string(),
                kind: VerifierErrorKind::DanglingPrefix,
            });
        }

        let unplaced_labels = self.labels.unplaced();
        let falls_through = self.stack.is_reachable();
        if falls_through || !unplaced_labels.is_empty() {
            return Err(Error::MethodBodyNotFinished {
                falls_through,
                unplaced_labels,
            });
        }

        Ok(FinishedCode {
            sink: self.sink,
            records: self.records,
            max_stack: self.max_stack,
            locals: self.locals,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::code::{listing, RecordingSink, SinkEvent};
    use crate::il::type_graph::TypeGraphArenas;
    use crate::il::{FieldFlags, MethodFlags, TypeFlags};

    #[test]
    fn receivers_and_locals() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let point = graph.add_value_type("Test.Point", system.value_type, TypeFlags::PUBLIC);
        let x = graph.add_field(point, "X", system.int32, FieldFlags::PUBLIC);
        let shift = graph.add_method(
            point,
            "Shift",
            vec![system.int32],
            Some(system.int32),
            MethodFlags::PUBLIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, shift, RecordingSink::new());
        assert_eq!(builder.arguments(), &[graph.by_ref(point), system.int32]);
        let tmp = builder.declare_local(system.int32).unwrap();
        assert_eq!(tmp.index(), 0);

        // this.X + shift
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder.push_instruction(Instruction::LdFld(x)).unwrap();
        builder.push_instruction(Instruction::LdArg(1)).unwrap();
        builder.push_instruction(Instruction::Add).unwrap();
        builder
            .push_instruction(Instruction::StLoc(tmp.index()))
            .unwrap();
        builder
            .push_instruction(Instruction::LdLoc(tmp.index()))
            .unwrap();
        assert_eq!(
            builder.current_stack(),
            &AbstractStack::Reachable(vec![TypeTag::Value(system.int32)])
        );
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.locals, vec![system.int32]);
        assert_eq!(code.records[1].stack_names(), Some(vec![String::from("Test.Point&")]));
        assert_eq!(
            listing(&code.records).lines().next(),
            Some("ldarg 0                 // []")
        );
    }

    #[test]
    fn failed_instructions_are_not_forwarded() {
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
        builder.push_instruction(Instruction::LdcI4(1)).unwrap();
        assert!(matches!(
            builder.push_instruction(Instruction::Add),
            Err(Error::Verifier {
                kind: VerifierErrorKind::StackUnderflow {
                    required: 2,
                    available: 1
                },
                ..
            })
        ));
        assert!(matches!(
            builder.push_branch_instruction(BranchInstruction::Throw),
            Err(Error::Verifier {
                kind: VerifierErrorKind::IncompatibleOperand { .. },
                ..
            })
        ));
        assert_eq!(builder.records().len(), 1);
        assert_eq!(builder.current_stack().len(), Some(1));

        builder.push_instruction(Instruction::Pop).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();
        let code = builder.finish().unwrap();
        assert_eq!(code.sink.instructions(), vec!["ldc.i4 1", "pop", "ret"]);
    }

    #[test]
    fn unfinished_bodies() {
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

        // Falling off the end
        let builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        assert!(matches!(
            builder.finish(),
            Err(Error::MethodBodyNotFinished {
                falls_through: true,
                ..
            })
        ));

        // Jumping to a label that is never placed
        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        let label = builder.define_label();
        builder
            .push_branch_instruction(BranchInstruction::Br(label))
            .unwrap();
        match builder.finish() {
            Err(Error::MethodBodyNotFinished {
                falls_through: false,
                unplaced_labels,
            }) => assert_eq!(unplaced_labels, vec![label]),
            _ => panic!("expected unplaced label"),
        }

        // Placing a label twice
        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        let label = builder.define_label();
        builder.mark_label(label).unwrap();
        assert!(matches!(
            builder.mark_label(label),
            Err(Error::DuplicateLabel(l)) if l == label
        ));

        // Unclosed region
        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        builder.begin_try().unwrap();
        assert!(matches!(
            builder.finish(),
            Err(Error::InvalidRegionNesting(_))
        ));
    }

    #[test]
    fn constrained_calls() {
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
        let point = graph.add_value_type("Test.Point", system.value_type, TypeFlags::PUBLIC);
        let method = graph.add_method(
            point,
            "Describe",
            vec![],
            Some(system.string),
            MethodFlags::PUBLIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        builder.push_instruction(Instruction::LdArg(0)).unwrap();
        builder
            .push_instruction(Instruction::Constrained(point))
            .unwrap();
        assert!(matches!(
            builder.push_instruction(Instruction::Nop),
            Err(Error::Verifier {
                kind: VerifierErrorKind::DanglingPrefix,
                ..
            })
        ));
        builder
            .push_instruction(Instruction::CallVirt(to_string))
            .unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        assert!(matches!(
            code.sink.events.as_slice(),
            [
                SinkEvent::Instruction(Instruction::LdArg(0)),
                SinkEvent::Instruction(Instruction::Constrained(_)),
                SinkEvent::Instruction(Instruction::CallVirt(_)),
                SinkEvent::Branch(BranchInstruction::Ret),
            ]
        ));

        // A prefix at the very end of the body dangles too
        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        builder
            .push_instruction(Instruction::Constrained(point))
            .unwrap();
        assert!(builder.finish().is_err());
    }

    #[test]
    fn handlers_exit_themselves() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let class = graph.add_class("Test.Program", system.object, TypeFlags::PUBLIC);
        let method = graph.add_method(
            class,
            "Run",
            vec![],
            Some(system.int32),
            MethodFlags::PUBLIC | MethodFlags::STATIC,
        );

        let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
        let outer = builder.begin_try().unwrap();
        let inner = builder.begin_try().unwrap();
        builder.push_instruction(Instruction::Nop).unwrap();

        let filter = builder.begin_filter(inner).unwrap();
        assert_eq!(
            builder.current_stack(),
            &AbstractStack::Reachable(vec![TypeTag::Value(system.exception)])
        );
        builder
            .push_instruction(Instruction::IsInst(system.exception))
            .unwrap();
        builder.push_instruction(Instruction::LdNull).unwrap();
        builder.push_instruction(Instruction::CgtUn).unwrap();
        builder.end_region(filter).unwrap();

        let catch = builder.begin_catch(inner, system.exception).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Rethrow)
            .unwrap();
        builder.end_region(catch).unwrap();
        builder.end_region(inner).unwrap();
        assert_eq!(builder.current_stack(), &AbstractStack::empty());

        let finally = builder.begin_finally(outer).unwrap();
        assert!(matches!(
            builder.push_branch_instruction(BranchInstruction::Rethrow),
            Err(Error::InvalidRegionNesting(_))
        ));
        assert!(matches!(
            builder.push_branch_instruction(BranchInstruction::Ret),
            Err(Error::InvalidRegionNesting(_))
        ));
        builder.end_region(finally).unwrap();
        builder.end_region(outer).unwrap();

        builder.push_instruction(Instruction::LdcI4(0)).unwrap();
        builder
            .push_branch_instruction(BranchInstruction::Ret)
            .unwrap();

        let code = builder.finish().unwrap();
        assert_eq!(
            code.sink.instructions(),
            vec![
                "nop",
                "leave L1",
                "isinst System.Exception",
                "ldnull",
                "cgt.un",
                "endfilter",
                "rethrow",
                "leave L0",
                "endfinally",
                "ldc.i4 0",
                "ret",
            ]
        );
    }
}
