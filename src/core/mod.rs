pub mod agent;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod memory;
pub mod sandbox;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod vault;
