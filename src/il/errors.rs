use super::code::Label;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Error trying to verify
    #[error("verification of `{instruction}` failed: {kind}")]
    Verifier {
        instruction: String,
        kind: VerifierErrorKind,
    },

    /// Two incoming edges of a label disagree on the stack
    #[error("inconsistent stack at merge point {label:?}: expected {expected:?} but found {found:?}")]
    StackShapeMismatch {
        label: Label,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// Exception regions were opened or closed in the wrong order
    #[error("invalid region nesting: {0}")]
    InvalidRegionNesting(String),

    /// A label was placed more than once (indicates a bug)
    #[error("label {0:?} is placed more than once")]
    DuplicateLabel(Label),

    /// A label was not generated by this builder
    #[error("label {0:?} is unknown")]
    UnknownLabel(Label),

    #[error("method body is not finished (falls through: {falls_through}, unplaced labels: {unplaced_labels:?})")]
    MethodBodyNotFinished {
        falls_through: bool,
        unplaced_labels: Vec<Label>,
    },

    #[error("missing type `{0}`")]
    MissingType(String),

    #[error("missing member `{0}`")]
    MissingMember(String),

    #[error("method `{0}` is ambiguous ({1} overloads match)")]
    AmbiguousMethod(String, usize),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifierErrorKind {
    #[error("stack underflow (needed {required} values, found {available})")]
    StackUnderflow { required: usize, available: usize },

    /// No signed/unsigned (or width) variant of the instruction exists for this type
    #[error("unsupported operand type `{0}`")]
    UnsupportedOperandType(String),

    #[error("missing operand context: {0}")]
    MissingOperandContext(&'static str),

    #[error("expected {expected} but found `{found}`")]
    IncompatibleOperand { expected: String, found: String },

    /// Argument or local index that does not exist
    #[error("invalid argument or local index {0}")]
    InvalidIndex(u16),

    /// `constrained.` not immediately followed by `callvirt`
    #[error("`constrained.` prefix must be immediately followed by `callvirt`")]
    DanglingPrefix,

    #[error("invalid instruction: {0}")]
    InvalidInstruction(&'static str),
}
