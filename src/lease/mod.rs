mod broker;
mod descriptor;
mod fs;

pub use broker::{Endpoint, LeaseBroker, LeaseHandle, SlotLease, SlotStore, WaitBudget};
pub use descriptor::LeaseDescriptor;
pub use fs::{FsSlotLease, FsSlotStore, LeaseStatus, is_pid_alive};

/// The broker as wired up in production: slots kept as locked files.
pub type FsLeaseBroker = LeaseBroker<FsSlotStore>;

/// A lease taken through [`FsLeaseBroker`].
pub type FsLeaseHandle = LeaseHandle<FsSlotLease>;
