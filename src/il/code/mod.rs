//! Building method bodies
//!
//! [`CodeBuilder`] is the entry point: it verifies each instruction against the abstract stack
//! (see [`crate::il::verifier`]), reconciles stacks at labels, tracks exception regions, and hands
//! the verified stream to a [`BytecodeSink`]. [`BodyWriter`] is the sink that produces the binary
//! method body, and [`RecordingSink`] just remembers what it was sent.

mod body_writer;
mod code_builder;
mod code_builder_exts;
mod instructions;
mod label;
mod record;
mod region;
mod sink;

pub use body_writer::*;
pub use code_builder::*;
pub use code_builder_exts::*;
pub use instructions::*;
pub use label::*;
pub use record::*;
pub use region::*;
pub use sink::*;
