//! Typed emission of method bodies for a stack-based VM
//!
//! The VM modelled here has the usual CIL shape: an operand stack of typed slots, arguments and
//! locals addressed by index, value types that live directly on the stack (or behind managed
//! addresses), and protected regions with `catch`, `filter`, `fault`, and `finally` handlers.
//!
//! The pieces, from the bottom up:
//!
//!   - [`type_graph`] is the metadata that instructions refer to (types, fields, methods)
//!   - [`verifier`] simulates the stack effect of every instruction on an abstract stack
//!   - [`code`] is the instruction set along with [`code::CodeBuilder`], which verifies every
//!     instruction as it is pushed and forwards it to a [`code::BytecodeSink`]

pub mod code;
mod errors;
mod flags;
pub mod type_graph;
pub mod verifier;

pub use errors::*;
pub use flags::*;
