//! Emit method bodies for a CIL-style stack machine, checking the operand stack as you go
//!
//! Every instruction pushed through a [`il::code::CodeBuilder`] is run through a small abstract
//! interpreter before being handed to the underlying sink. Stack underflows, operands of the wrong
//! type, and branches that disagree about the shape of the stack at a label are all reported at
//! the offending call instead of when the VM eventually loads the method.
//!
//! ```
//! use ilemit::il::code::{BranchInstruction, CodeBuilder, Instruction, RecordingSink};
//! use ilemit::il::type_graph::{TypeGraph, TypeGraphArenas};
//! use ilemit::il::{MethodFlags, TypeFlags};
//!
//! let arenas = TypeGraphArenas::new();
//! let graph = TypeGraph::new(&arenas);
//! let system = graph.insert_system_types();
//! let class = graph.add_class("Demo.Math", system.object, TypeFlags::PUBLIC);
//! let method = graph.add_method(
//!     class,
//!     "Three",
//!     vec![],
//!     Some(system.int32),
//!     MethodFlags::PUBLIC | MethodFlags::STATIC,
//! );
//!
//! let mut builder = CodeBuilder::new(&graph, &system, method, RecordingSink::new());
//! builder.push_instruction(Instruction::LdcI4(1)).unwrap();
//! builder.push_instruction(Instruction::LdcI4(2)).unwrap();
//! builder.push_instruction(Instruction::Add).unwrap();
//! builder.push_branch_instruction(BranchInstruction::Ret).unwrap();
//!
//! let code = builder.finish().unwrap();
//! assert_eq!(code.max_stack, 2);
//! ```

pub mod il;
pub mod util;
