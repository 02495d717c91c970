use bitcoin::{Amount, FeeRate};

/// Fee owed for `vsize` virtual bytes at `fee_rate`.
///
/// Returns `None` on overflow.
pub fn get_fee(fee_rate: FeeRate, vsize: u64) -> Option<Amount> { fee_rate.fee_vb(vsize) }
