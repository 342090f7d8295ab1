pub mod backend;
pub mod failover;
pub mod gate;
pub mod local;
pub mod memory;
pub mod provision;
pub mod remote;

pub use backend::{BackendKind, CacheBackend, CacheError};
pub use failover::{ActiveBackend, CacheMode, FailoverCache};
pub use gate::CooldownGate;
pub use local::LocalCache;
pub use memory::MemoryCache;
pub use provision::{HostFacts, LocalProvisioner, Provision, ProvisionConfig};
pub use remote::RemoteCache;
