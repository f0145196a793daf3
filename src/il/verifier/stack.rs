use super::{branch_effect, stack_effect, Produce, StackEffect, TypeTag, VerifierContext};
use crate::il::code::{BranchInstruction, Instruction};
use crate::il::VerifierErrorKind;
use std::fmt;

/// Operand stack at one point in the method body
///
/// Slots are stored bottom first.
#[derive(Clone, PartialEq, Eq)]
pub enum AbstractStack<'g> {
    /// No known control flow reaches this point (yet)
    Unreachable,

    Reachable(Vec<TypeTag<'g>>),
}

impl<'g> AbstractStack<'g> {
    pub fn empty() -> Self {
        AbstractStack::Reachable(vec![])
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, AbstractStack::Reachable(_))
    }

    /// Slots on the stack (bottom first), or `None` if unreachable
    pub fn types(&self) -> Option<&[TypeTag<'g>]> {
        match self {
            AbstractStack::Unreachable => None,
            AbstractStack::Reachable(stack) => Some(stack),
        }
    }

    pub fn len(&self) -> Option<usize> {
        self.types().map(|stack| stack.len())
    }

    /// Slot at `depth` below the top of the stack (0 is the top)
    pub fn peek(&self, depth: usize) -> Option<&TypeTag<'g>> {
        let stack = self.types()?;
        stack.len().checked_sub(depth + 1).map(|idx| &stack[idx])
    }

    /// Is this stack usable at a point where `recorded` is expected?
    ///
    /// Both stacks must have the same depth, and each slot here must be assignable to the
    /// corresponding recorded slot.
    pub fn is_compatible_with(&self, recorded: &AbstractStack<'g>) -> bool {
        match (self, recorded) {
            (AbstractStack::Unreachable, AbstractStack::Unreachable) => true,
            (AbstractStack::Reachable(found), AbstractStack::Reachable(expected)) => {
                found.len() == expected.len()
                    && found
                        .iter()
                        .zip(expected.iter())
                        .all(|(found, expected)| found.is_assignable(expected))
            }
            _ => false,
        }
    }

    /// Type names of the slots (bottom first), or `None` if unreachable
    pub fn names(&self) -> Option<Vec<String>> {
        self.types()
            .map(|stack| stack.iter().map(TypeTag::name).collect())
    }

    /// Update the stack to reflect the effects of the given (non-branching) instruction
    ///
    /// Nothing is checked in unreachable code.
    pub fn apply(
        &mut self,
        insn: &Instruction<'g>,
        ctx: &VerifierContext<'_, 'g>,
    ) -> Result<(), VerifierErrorKind> {
        if !self.is_reachable() {
            return Ok(());
        }
        let effect = stack_effect(insn, ctx)?;
        self.apply_effect(&effect, ctx).map_err(|kind| {
            if let (
                VerifierErrorKind::IncompatibleOperand { expected, found },
                Instruction::Call(method)
                | Instruction::CallVirt(method)
                | Instruction::NewObj(method),
            ) = (&kind, insn)
            {
                log::error!(
                    "Incompatible argument: found {} but expected {} (for {:?})",
                    found,
                    expected,
                    method
                );
            }
            kind
        })
    }

    /// Update the stack to reflect the effects of a branching instruction
    ///
    /// Returns the stack delivered to the jump targets. After `leave` this is the empty stack, and
    /// after an instruction which doesn't fall through, the stack itself becomes unreachable.
    pub fn apply_branch<Lbl>(
        &mut self,
        insn: &BranchInstruction<Lbl>,
        ctx: &VerifierContext<'_, 'g>,
    ) -> Result<AbstractStack<'g>, VerifierErrorKind> {
        if !self.is_reachable() {
            return Ok(AbstractStack::Unreachable);
        }
        let effect = branch_effect(insn, ctx)?;
        self.apply_effect(&effect, ctx)?;

        let delivered = match insn {
            BranchInstruction::Leave(_) => AbstractStack::empty(),
            _ => self.clone(),
        };
        if insn.is_terminal() {
            *self = AbstractStack::Unreachable;
        }
        Ok(delivered)
    }

    /// Pop and check operands, then push results
    ///
    /// The stack is only modified once all of the checks have passed.
    fn apply_effect(
        &mut self,
        effect: &StackEffect<'g>,
        ctx: &VerifierContext<'_, 'g>,
    ) -> Result<(), VerifierErrorKind> {
        let stack = match self {
            AbstractStack::Unreachable => return Ok(()),
            AbstractStack::Reachable(stack) => stack,
        };

        let required = effect.pops.len();
        let available = stack.len();
        if available < required {
            return Err(VerifierErrorKind::StackUnderflow {
                required,
                available,
            });
        }
        let split = available - required;
        let popped: Vec<TypeTag<'g>> = stack[split..].iter().rev().copied().collect();

        for (expect, found) in effect.pops.iter().zip(popped.iter()) {
            expect.check(found)?;
        }
        let pair_result = match (&effect.pair, popped.as_slice()) {
            (Some(rule), [right, left, ..]) => Some(rule.result(left, right, ctx.system)?),
            _ => None,
        };

        let mut pushed = Vec::with_capacity(effect.pushes.len());
        for produce in &effect.pushes {
            let tag = match produce {
                Produce::Type(tag) => *tag,
                Produce::Popped(idx) => {
                    *popped
                        .get(*idx)
                        .ok_or(VerifierErrorKind::InvalidInstruction(
                            "result refers to an operand that was not popped",
                        ))?
                }
                Produce::Arithmetic => pair_result.ok_or(
                    VerifierErrorKind::InvalidInstruction("arithmetic result without operands"),
                )?,
            };
            pushed.push(tag);
        }

        stack.truncate(split);
        stack.extend(pushed);
        Ok(())
    }
}

impl<'g> fmt::Debug for AbstractStack<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractStack::Unreachable => f.write_str("unreachable"),
            AbstractStack::Reachable(stack) => f.debug_list().entries(stack.iter()).finish(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::code::{Comparison, Instruction::*};
    use crate::il::type_graph::{SystemTypes, TypeGraph, TypeGraphArenas, TypeId};

    fn context<'a, 'g>(
        graph: &'a TypeGraph<'g>,
        system: &'a SystemTypes<'g>,
        locals: &'a [TypeId<'g>],
        return_type: Option<TypeId<'g>>,
    ) -> VerifierContext<'a, 'g> {
        VerifierContext {
            graph,
            system,
            arguments: &[],
            locals,
            return_type,
            constrained: None,
        }
    }

    #[test]
    fn arithmetic() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let ctx = context(&graph, &system, &[], None);

        let int32 = TypeTag::Value(system.int32);
        let int64 = TypeTag::Value(system.int64);
        let intptr = TypeTag::Value(system.intptr);
        let double = TypeTag::Value(system.double);
        let string = TypeTag::Value(system.string);

        let binops = [
            (vec![int32, int64, intptr, double], vec![Add, Sub, Mul, Div, Rem]),
            (
                vec![int32, int64, intptr],
                vec![DivUn, RemUn, And, Or, Xor, AddOvf, SubOvfUn, MulOvf],
            ),
        ];

        for (good_typs, instructions) in binops {
            for instruction in instructions {
                // Try a bunch of different types
                for typ in [int32, int64, intptr, double, string, TypeTag::Null] {
                    let mut stack = AbstractStack::Reachable(vec![typ, typ]);
                    if good_typs.contains(&typ) {
                        assert!(
                            stack.apply(&instruction, &ctx).is_ok(),
                            "Verification of {} on {:?}",
                            instruction,
                            typ
                        );
                        assert_eq!(
                            stack,
                            AbstractStack::Reachable(vec![typ]),
                            "Verification output of {}",
                            instruction
                        );
                    } else {
                        assert!(
                            matches!(
                                stack.apply(&instruction, &ctx),
                                Err(VerifierErrorKind::IncompatibleOperand { .. })
                            ),
                            "Verification of {} on {:?}",
                            instruction,
                            typ
                        );
                    }
                }

                // Try with a stack that is too small
                let mut stack = AbstractStack::Reachable(vec![good_typs[0]]);
                assert_eq!(
                    stack.apply(&instruction, &ctx),
                    Err(VerifierErrorKind::StackUnderflow {
                        required: 2,
                        available: 1
                    }),
                    "Verification of {}",
                    instruction
                );
                assert_eq!(stack, AbstractStack::Reachable(vec![good_typs[0]]));
            }
        }
    }

    #[test]
    fn stack_length_tracks_pops_and_pushes() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let locals = [system.int32, system.string];
        let ctx = context(&graph, &system, &locals, None);

        let program = [
            (LdcI4(1), 0, 1),
            (Dup, 1, 2),
            (LdLoc(0), 0, 1),
            (Add, 2, 1),
            (LdLoc(1), 0, 1),
            (Pop, 1, 0),
            (Ceq, 2, 1),
            (StLoc(0), 1, 0),
        ];

        let mut stack = AbstractStack::empty();
        let mut expected_len: usize = 0;
        for (insn, pops, pushes) in program {
            stack.apply(&insn, &ctx).unwrap();
            expected_len = expected_len - pops + pushes;
            assert_eq!(stack.len(), Some(expected_len), "after {}", insn);
        }
        assert_eq!(stack, AbstractStack::empty());

        assert_eq!(
            stack.apply(&Pop, &ctx),
            Err(VerifierErrorKind::StackUnderflow {
                required: 1,
                available: 0
            })
        );
        assert_eq!(
            stack.apply(&LdLoc(2), &ctx),
            Err(VerifierErrorKind::InvalidIndex(2))
        );
        assert!(matches!(
            stack.apply(&LdcI4(0), &ctx).and_then(|_| stack.apply(&StLoc(1), &ctx)),
            Err(VerifierErrorKind::IncompatibleOperand { .. })
        ));
    }

    #[test]
    fn branches() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let ctx = context(&graph, &system, &[], Some(system.int32));
        let int32 = TypeTag::Value(system.int32);

        // Conditional branches deliver the post-pop stack and fall through
        let mut stack = AbstractStack::Reachable(vec![int32, int32, int32]);
        let delivered = stack
            .apply_branch(&BranchInstruction::BranchIf(Comparison::Lt, ()), &ctx)
            .unwrap();
        assert_eq!(delivered, AbstractStack::Reachable(vec![int32]));
        assert_eq!(stack, delivered);

        // `leave` delivers an empty stack
        let delivered = stack
            .apply_branch(&BranchInstruction::Leave(()), &ctx)
            .unwrap();
        assert_eq!(delivered, AbstractStack::empty());
        assert_eq!(stack, AbstractStack::Unreachable);

        // Nothing is checked in unreachable code
        assert!(stack.apply(&Pop, &ctx).is_ok());
        assert!(stack.apply_branch(&BranchInstruction::<()>::Ret, &ctx).is_ok());
        assert_eq!(stack, AbstractStack::Unreachable);

        // `ret` checks the return value
        let mut stack = AbstractStack::Reachable(vec![TypeTag::Value(system.string)]);
        assert!(matches!(
            stack.apply_branch(&BranchInstruction::<()>::Ret, &ctx),
            Err(VerifierErrorKind::IncompatibleOperand { .. })
        ));
        let mut stack = AbstractStack::Reachable(vec![int32]);
        assert!(stack.apply_branch(&BranchInstruction::<()>::Ret, &ctx).is_ok());
        assert_eq!(stack, AbstractStack::Unreachable);
    }
}
