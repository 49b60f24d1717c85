//! chemist-lifecycle — the auto-scaling event state machine.
//!
//! A stream of launch/terminate messages from the cloud queue is parsed,
//! classified against discovery, translated into repository mutations, and
//! answered with an [`Action`]: either nothing, or a redistribution delta
//! handed to the distribute workers.

pub mod error;
pub mod interpreter;
pub mod message;
pub mod queue;
pub mod runner;

pub use error::{LifecycleError, LifecycleResult};
pub use interpreter::{Action, Interpreter, Mutation, Outcome};
pub use message::{parse_message, CloudMessage};
pub use queue::{EventQueue, InMemoryQueue, QueueMessage};
pub use runner::{run_lifecycle_loop, RunnerContext};
