//! CPU miner loop.

use std::sync::{Arc, Mutex};

use bitcoind_chainstate::chain::Chain;
use bitcoind_pow::validation::check_proof_of_work;
use bitcoind_primitives::Block;
use bitcoind_storage::KeyValueStore;
use tokio::sync::watch;

use crate::mempool::Mempool;
use crate::template::{create_template, BlockTemplate, MinerOptions};

const STOP_CHECK_MASK: u32 = 0xfff;

pub struct CpuMiner<S> {
    chain: Arc<Chain<S>>,
    options: MinerOptions,
    stopping: watch::Receiver<bool>,
}

impl<S: KeyValueStore> CpuMiner<S> {
    /// Returns the miner and the handle that stops it. The flag is
    /// observed between attempts and periodically inside the nonce
    /// loop.
    pub fn new(chain: Arc<Chain<S>>, options: MinerOptions) -> (Self, watch::Sender<bool>) {
        let (sender, stopping) = watch::channel(false);
        (
            Self {
                chain,
                options,
                stopping,
            },
            sender,
        )
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Iterate nonces over a template. Returns `None` when the nonce
    /// space is exhausted or the miner was stopped.
    pub fn mine_block(&self, template: &BlockTemplate) -> Option<Block> {
        let mut block = template.to_block();
        let params = self.chain.params();
        let mut nonce = 0u32;
        loop {
            if nonce & STOP_CHECK_MASK == 0 && self.is_stopping() {
                return None;
            }
            block.header.nonce = nonce;
            if check_proof_of_work(&block.header, params).is_ok() {
                return Some(block.into_immutable());
            }
            nonce = match nonce.checked_add(1) {
                Some(next) => next,
                None => return None,
            };
        }
    }

    /// Mine continuously until stopped, rebuilding the template for
    /// every attempt so new tips and mempool changes are picked up.
    pub async fn run(self, mempool: Arc<Mutex<Mempool>>) {
        loop {
            if self.is_stopping() {
                break;
            }
            let template = {
                let Ok(pool) = mempool.lock() else {
                    eprintln!("mempool lock poisoned; miner exiting");
                    break;
                };
                create_template(&self.chain, &pool, &self.options)
            };
            let template = match template {
                Ok(template) => template,
                Err(err) => {
                    eprintln!("block template build failed: {err}");
                    break;
                }
            };
            let Some(block) = self.mine_block(&template) else {
                continue;
            };
            if self.is_stopping() {
                break;
            }
            if let Err(err) = self.chain.add(block).await {
                eprintln!("mined block rejected: {err}");
            }
            tokio::task::yield_now().await;
        }
    }
}
