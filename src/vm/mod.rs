// Virtance lifecycle

pub mod coordinator;
pub mod hypervisor;
pub mod spec;

// Re-exports
pub use coordinator::{Coordinator, SnapshotInfo};
pub use hypervisor::{Hypervisor, HypervisorFault};
pub use spec::{State, Virtance};

use crate::error::Error;

/// Wraps a hypervisor fault with the operation and entity it interrupted
pub(crate) fn hypervisor_error(operation: &str, entity: &str, fault: HypervisorFault) -> Error {
    Error::Hypervisor {
        operation: operation.to_string(),
        entity: entity.to_string(),
        message: fault.to_string(),
    }
}
