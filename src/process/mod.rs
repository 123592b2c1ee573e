// Process module - Child handles, restart policy and shutdown

pub mod restart;
pub mod shutdown;
pub mod spawner;
pub mod types;

pub use restart::{BackoffStrategy, Decision, RestartPolicy, RestartTracker};
pub use shutdown::{classify, ExitClass, ExitOutcome};
pub use spawner::{launch, ProcessHandle};
pub use types::{CrashEvent, ExitDescriptor, ProcessInfo, ProcessInstance, ProcessState};
