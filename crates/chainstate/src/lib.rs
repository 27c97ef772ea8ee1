//! Block validation and chain management.

pub mod chain;
pub mod coins;
pub mod db;
pub mod deployment;
pub mod entry;
pub mod error;
pub mod events;
pub mod genesis;
pub mod locker;
pub mod metrics;
pub mod timedata;
pub mod validation;

pub use chain::{Chain, ChainOptions};
pub use coins::{Coin, CoinView, UtxoSet};
pub use db::ChainDB;
pub use deployment::{DeploymentState, ThresholdState};
pub use entry::ChainEntry;
pub use error::ChainError;
pub use events::ChainEvent;
pub use genesis::genesis_block;
pub use timedata::TimeData;
