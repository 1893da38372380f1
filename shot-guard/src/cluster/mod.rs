//! Cluster flow control: several processes share one quota through a remote
//! counter keyed by resource and time bucket.

mod checker;
mod memory_store;
mod token_service;

pub use checker::ClusterChecker;
pub use memory_store::MemoryCounterStore;
pub use token_service::CounterStore;
pub use token_service::TokenServer;
pub use token_service::TokenService;
