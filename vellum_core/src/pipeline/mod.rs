//! Pipeline descriptions and the interpreter that runs them.

pub mod description;
pub mod executor;
pub mod interpreter;
pub mod registry;
pub mod scope;
pub mod substitute;

pub use description::{ArgumentSpec, Instruction, Pipeline, PipelineSet};
pub use executor::{Executor, Pending, wait_all};
pub use interpreter::{FailureRecord, Interpreter, RunReport};
pub use registry::{Changes, Invocation, OperationRegistry};
pub use scope::{Scope, Value};
pub use substitute::{resolve_value, substitute};
