pub mod attendance;
pub mod gateway;
pub mod ledger;
pub mod notifications;
pub mod orchestrator;
pub mod precharge;
pub mod resolution;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod webhook;
