//! Run lifecycle: state machine, persistence seam, execution and the driver
//! that ties them together.

pub mod cancel;
pub mod driver;
pub mod executor;
pub mod prompt;
pub mod sqlite_store;
pub mod state;
pub mod store;

pub use cancel::CancellationRegistry;
pub use driver::{RunDriver, RunOutcome, MISSING_PRECONDITION_REASON};
pub use executor::{
    ExecutionError, ExecutionRequest, ExecutionStep, PlanningExecutor, RunExecutor,
    ScriptedExecutor, StepStream,
};
pub use sqlite_store::SqliteRunStore;
pub use state::{Run, TransitionError};
pub use store::{Crew, CrewRecipe, InMemoryRunStore, Instructions, RunStore, RunStoreError};
