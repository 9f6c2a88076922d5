//! Core services shared by the runtime models: collaborator traits, the
//! fault-tolerant probe, scoped protection changes and the coordinator.

pub mod coordinator;
pub mod environment;
pub mod fault;
pub mod protection;
