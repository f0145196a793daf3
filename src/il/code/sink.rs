use super::{BranchInstruction, Instruction, Label, Region, RegionKind};
use crate::il::Error;

/// Consumer of verified instructions, in emission order
///
/// The sink is responsible for the final binary layout (instruction encodings, branch offsets,
/// exception clause tables). Everything it receives has already been checked, so it never needs
/// to reason about the stack.
pub trait BytecodeSink<'g> {
    fn emit(&mut self, insn: &Instruction<'g>) -> Result<(), Error>;

    fn emit_branch(&mut self, insn: &BranchInstruction<Label>) -> Result<(), Error>;

    /// The next instruction is the target of the label
    fn mark_label(&mut self, label: Label) -> Result<(), Error>;

    /// Start a protected block (`try_region` is `None`) or one of its handlers
    fn begin_region(
        &mut self,
        region: Region,
        kind: RegionKind<'g>,
        try_region: Option<Region>,
    ) -> Result<(), Error>;

    fn end_region(&mut self, region: Region) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent<'g> {
    Instruction(Instruction<'g>),
    Branch(BranchInstruction<Label>),
    Label(Label),
    BeginRegion(Region, RegionKind<'g>),
    EndRegion(Region),
}

/// Sink which just remembers everything it was sent
#[derive(Debug, Default)]
pub struct RecordingSink<'g> {
    pub events: Vec<SinkEvent<'g>>,
}

impl<'g> RecordingSink<'g> {
    pub fn new() -> RecordingSink<'g> {
        RecordingSink { events: vec![] }
    }

    /// Just the straight-line and branch instructions (rendered), in order
    pub fn instructions(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Instruction(insn) => Some(insn.to_string()),
                SinkEvent::Branch(insn) => Some(insn.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl<'g> BytecodeSink<'g> for RecordingSink<'g> {
    fn emit(&mut self, insn: &Instruction<'g>) -> Result<(), Error> {
        self.events.push(SinkEvent::Instruction(insn.clone()));
        Ok(())
    }

    fn emit_branch(&mut self, insn: &BranchInstruction<Label>) -> Result<(), Error> {
        self.events.push(SinkEvent::Branch(insn.clone()));
        Ok(())
    }

    fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        self.events.push(SinkEvent::Label(label));
        Ok(())
    }

    fn begin_region(
        &mut self,
        region: Region,
        kind: RegionKind<'g>,
        _try_region: Option<Region>,
    ) -> Result<(), Error> {
        self.events.push(SinkEvent::BeginRegion(region, kind));
        Ok(())
    }

    fn end_region(&mut self, region: Region) -> Result<(), Error> {
        self.events.push(SinkEvent::EndRegion(region));
        Ok(())
    }
}
