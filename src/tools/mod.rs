// # Tool Registry
//
// Typed, versioned, risk-tagged callable units. Descriptors are immutable
// after registration; invocation runs the full pipeline: schema validation,
// capability check, rate limit, safety consult, bounded execution, return
// validation, audit.

pub mod descriptor;
pub mod registry;

pub use descriptor::{
    ParamSpec, ParamType, ParameterSchema, ToolCategory, ToolContext, ToolDescriptor,
    ToolImplementation,
};
pub use registry::ToolRegistry;
