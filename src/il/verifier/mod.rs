//! Stack verification utilities
//!
//! At any point in a method body, every path reaching that point must agree on the shape of the
//! operand stack: how many values are on it and what type each one has. The VM checks this when it
//! loads the method, but by then it is hard to work out which part of the code generator got it
//! wrong. Instead, we run a small abstract interpreter alongside emission:
//!
//!   - [`TypeTag`] is the type of one stack slot, and [`AbstractStack`] is the whole stack (or
//!     the marker that the current point is unreachable)
//!   - [`stack_effect`] and [`branch_effect`] say what every instruction pops and pushes
//!   - [`AbstractStack::apply`] checks the operands of an instruction and updates the stack
//!
//! There is no fixpoint iteration: the first stack recorded for a label is the one every other
//! path to it must be compatible with (see [`crate::il::code::LabelTable`]).

mod effects;
mod stack;
mod types;

pub use effects::*;
pub use stack::*;
pub use types::*;
