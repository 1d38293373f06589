//! Murmur Runtime
//!
//! Allocates triple-role state buffers for a frozen model graph and
//! executes the layered step loop over them.

pub mod buffers;
pub mod device;
pub mod error;
pub mod plan;
pub mod population;
pub mod scheduler;

pub use buffers::{BufferRole, StateBuffers};
pub use device::{Device, DeviceAlloc, HostDevice};
pub use error::{Result, RuntimeError};
pub use plan::{PropertyValue, RunPlan, RunPlanVector};
pub use population::PopulationBatch;
pub use scheduler::{
    AgentContext, AgentKernel, AgentOutput, ExitCondition, MessageView, MessagesView, SimState,
    Simulation, StepOutcome, StepView,
};
