use crate::il::verifier::AbstractStack;
use crate::il::Error;
use std::fmt;

/// Opaque label
///
/// Labels are handles into the [`LabelTable`] of the builder that generated them.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}

/// Where a label is in its life
#[derive(Clone, Debug, PartialEq, Eq)]
enum LabelState<'g> {
    /// Generated, but nothing has reached it yet
    Pending,

    /// Some edge has reached it, so it has a recorded stack, but it hasn't been placed
    Bound(AbstractStack<'g>),

    /// Placed in the code (the stack is `Unreachable` if nothing reached it before placement)
    Placed(AbstractStack<'g>),
}

/// Labels of one method body along with the stack recorded for each
///
/// Every label carries exactly one recorded stack: the first one to reach it. All other edges into
/// the label (branches before or after placement, and the fall through at the placement itself)
/// must be compatible with that first stack.
#[derive(Default)]
pub struct LabelTable<'g> {
    labels: Vec<LabelState<'g>>,
}

impl<'g> LabelTable<'g> {
    pub fn new() -> LabelTable<'g> {
        LabelTable { labels: vec![] }
    }

    /// Generate a fresh label
    pub fn define(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelState::Pending);
        label
    }

    fn state(&self, label: Label) -> Result<&LabelState<'g>, Error> {
        self.labels
            .get(label.index())
            .ok_or(Error::UnknownLabel(label))
    }

    fn state_mut(&mut self, label: Label) -> Result<&mut LabelState<'g>, Error> {
        self.labels
            .get_mut(label.index())
            .ok_or(Error::UnknownLabel(label))
    }

    /// Check that a label exists
    pub fn check(&self, label: Label) -> Result<(), Error> {
        self.state(label).map(|_| ())
    }

    /// Stack recorded for the label, if anything has reached it yet
    pub fn recorded_stack(&self, label: Label) -> Option<&AbstractStack<'g>> {
        match self.state(label).ok()? {
            LabelState::Pending => None,
            LabelState::Bound(stack) | LabelState::Placed(stack) => Some(stack),
        }
    }

    pub fn is_placed(&self, label: Label) -> bool {
        matches!(self.state(label), Ok(LabelState::Placed(_)))
    }

    /// Check that an edge carrying the given stack could reach the label, without recording it
    pub fn check_edge(&self, label: Label, incoming: &AbstractStack<'g>) -> Result<(), Error> {
        let recorded = match self.state(label)? {
            _ if !incoming.is_reachable() => return Ok(()),
            LabelState::Pending | LabelState::Placed(AbstractStack::Unreachable) => return Ok(()),
            LabelState::Bound(recorded) | LabelState::Placed(recorded) => recorded,
        };

        if incoming.is_compatible_with(recorded) {
            Ok(())
        } else {
            Err(Error::StackShapeMismatch {
                label,
                expected: recorded.names().unwrap_or_default(),
                found: incoming.names().unwrap_or_default(),
            })
        }
    }

    /// Account for an edge into the label carrying the given stack
    ///
    /// Unreachable edges are ignored. The first reachable edge records its stack, and later edges
    /// must be compatible with it. Re-recording the same stack is a no-op.
    pub fn reconcile(&mut self, label: Label, incoming: &AbstractStack<'g>) -> Result<(), Error> {
        self.check_edge(label, incoming)?;
        if !incoming.is_reachable() {
            return Ok(());
        }

        let state = self.state_mut(label)?;
        match state {
            LabelState::Pending => *state = LabelState::Bound(incoming.clone()),
            LabelState::Placed(AbstractStack::Unreachable) => {
                log::warn!(
                    "{:?} was placed in unreachable code and is only now reached with {:?}",
                    label,
                    incoming
                );
                *state = LabelState::Placed(incoming.clone());
            }
            LabelState::Bound(_) | LabelState::Placed(_) => (),
        }
        Ok(())
    }

    /// Place the label at the current point in the code
    ///
    /// The fall through into the label is reconciled like any other edge, and the stack that code
    /// after the label starts with is returned. If nothing has reached the label yet, that stack
    /// is `Unreachable`.
    pub fn place(
        &mut self,
        label: Label,
        fall_through: &AbstractStack<'g>,
    ) -> Result<AbstractStack<'g>, Error> {
        if let LabelState::Placed(_) = self.state(label)? {
            return Err(Error::DuplicateLabel(label));
        }
        self.reconcile(label, fall_through)?;

        let state = self.state_mut(label)?;
        let resume = match state {
            LabelState::Bound(recorded) => recorded.clone(),
            _ => AbstractStack::Unreachable,
        };
        *state = LabelState::Placed(resume.clone());
        Ok(resume)
    }

    /// Labels which have been reached by some branch but never placed
    pub fn unplaced(&self) -> Vec<Label> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, state)| matches!(state, LabelState::Bound(_)))
            .map(|(idx, _)| Label(idx as u32))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::type_graph::{TypeGraph, TypeGraphArenas};
    use crate::il::verifier::TypeTag;

    #[test]
    fn first_recorded_stack_wins() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let ints = AbstractStack::Reachable(vec![TypeTag::Value(system.int32)]);
        let two_ints = AbstractStack::Reachable(vec![
            TypeTag::Value(system.int32),
            TypeTag::Value(system.int32),
        ]);

        let mut labels = LabelTable::new();
        let label = labels.define();
        assert_eq!(labels.recorded_stack(label), None);

        // Checking an edge doesn't record anything
        labels.check_edge(label, &ints).unwrap();
        labels.check_edge(label, &two_ints).unwrap();
        assert_eq!(labels.recorded_stack(label), None);
        assert!(labels.unplaced().is_empty());

        labels.reconcile(label, &ints).unwrap();
        assert!(labels.check_edge(label, &two_ints).is_err());
        labels.reconcile(label, &ints).unwrap();
        labels.reconcile(label, &AbstractStack::Unreachable).unwrap();
        assert_eq!(labels.recorded_stack(label), Some(&ints));
        assert_eq!(labels.unplaced(), vec![label]);

        assert!(matches!(
            labels.reconcile(label, &two_ints),
            Err(Error::StackShapeMismatch { label: l, .. }) if l == label
        ));

        // Placing resumes with the recorded stack, even if the fall through is dead
        assert_eq!(
            labels.place(label, &AbstractStack::Unreachable).unwrap(),
            ints
        );
        assert!(labels.is_placed(label));
        assert!(labels.unplaced().is_empty());
        assert!(matches!(
            labels.place(label, &ints),
            Err(Error::DuplicateLabel(l)) if l == label
        ));
    }

    #[test]
    fn subtypes_reach_recorded_supertypes() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let objects = AbstractStack::Reachable(vec![TypeTag::Value(system.object)]);
        let strings = AbstractStack::Reachable(vec![TypeTag::Value(system.string)]);

        let mut labels = LabelTable::new();
        let label = labels.define();
        labels.reconcile(label, &objects).unwrap();
        labels.reconcile(label, &strings).unwrap();
        assert_eq!(labels.place(label, &strings).unwrap(), objects);

        // ... but not the other way around
        let other = labels.define();
        labels.reconcile(other, &strings).unwrap();
        assert!(labels.reconcile(other, &objects).is_err());
    }

    #[test]
    fn dead_labels() {
        let arenas = TypeGraphArenas::new();
        let graph = TypeGraph::new(&arenas);
        let system = graph.insert_system_types();
        let ints = AbstractStack::Reachable(vec![TypeTag::Value(system.int32)]);

        let mut labels = LabelTable::new();
        let label = labels.define();
        assert_eq!(
            labels.place(label, &AbstractStack::Unreachable).unwrap(),
            AbstractStack::Unreachable
        );

        // A later backward branch supplies the stack
        labels.reconcile(label, &ints).unwrap();
        assert_eq!(labels.recorded_stack(label), Some(&ints));
        assert!(labels.reconcile(label, &AbstractStack::empty()).is_err());

        let mut other_table = LabelTable::new();
        assert!(matches!(
            other_table.reconcile(label, &ints),
            Err(Error::UnknownLabel(_))
        ));
    }
}
