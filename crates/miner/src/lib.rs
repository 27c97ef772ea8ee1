//! Block template assembly and CPU mining.

pub mod cpu;
pub mod mempool;
pub mod template;

pub use cpu::CpuMiner;
pub use mempool::{build_mempool_entry, Mempool, MempoolEntry, MempoolError};
pub use template::{create_template, BlockTemplate, MinerOptions};
