use super::{BranchInstruction, Instruction, Label};
use crate::il::verifier::AbstractStack;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum RecordedInstruction<'g> {
    Straight(Instruction<'g>),
    Branch(BranchInstruction<Label>),
}

impl<'g> fmt::Display for RecordedInstruction<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordedInstruction::Straight(insn) => insn.fmt(f),
            RecordedInstruction::Branch(insn) => insn.fmt(f),
        }
    }
}

/// Instruction that was emitted along with the stack it was verified against
///
/// These are kept so that a method body can be dumped with its inferred stack shapes when
/// something goes wrong further down the line.
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionRecord<'g> {
    pub instruction: RecordedInstruction<'g>,
    pub stack_before: AbstractStack<'g>,
}

impl<'g> InstructionRecord<'g> {
    /// Type names on the stack before the instruction (bottom first), or `None` if unreachable
    pub fn stack_names(&self) -> Option<Vec<String>> {
        self.stack_before.names()
    }
}

impl<'g> fmt::Display for InstructionRecord<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instruction = self.instruction.to_string();
        match self.stack_names() {
            Some(names) => write!(f, "{:<24}// [{}]", instruction, names.join(", ")),
            None => write!(f, "{:<24}// unreachable", instruction),
        }
    }
}

/// Render records one per line
pub fn listing(records: &[InstructionRecord<'_>]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_string());
        out.push('\n');
    }
    out
}
