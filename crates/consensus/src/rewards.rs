//! Subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Base block reward at the given height, following the halving schedule.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_every_interval() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 1_250_000_000);
        assert_eq!(block_subsidy(210_000 * 64, &params), 0);
    }
}
