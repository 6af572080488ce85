//! Fee arithmetic and quoted-price validity
//!
//! Intermediaries charge `base_fee + amount * fee_ppm / 1_000_000`,
//! denominated in the input asset. All arithmetic is integer, widened to
//! u128 for the products, with rounding against the client on the
//! exact-output inverse.

use serde::{Deserialize, Serialize};

pub const PPM: u64 = 1_000_000;

/// Proportional fee component on `amount`
pub fn proportional_fee(amount: u64, fee_ppm: u64) -> u64 {
    ((amount as u128 * fee_ppm as u128) / PPM as u128) as u64
}

/// Total fee charged on an input of `amount_in`
pub fn total_fee(amount_in: u64, base_fee: u64, fee_ppm: u64) -> u64 {
    base_fee.saturating_add(proportional_fee(amount_in, fee_ppm))
}

/// Output produced by an exact input, after fees
pub fn output_for_input(amount_in: u64, base_fee: u64, fee_ppm: u64) -> u64 {
    amount_in.saturating_sub(total_fee(amount_in, base_fee, fee_ppm))
}

/// Smallest input whose fee-reduced value covers `amount_out`
pub fn input_for_output(amount_out: u64, base_fee: u64, fee_ppm: u64) -> u64 {
    debug_assert!(fee_ppm < PPM);
    let gross = amount_out as u128 + base_fee as u128;
    let denom = (PPM - fee_ppm) as u128;
    // ceil(gross * PPM / denom), then walk down: the proportional fee
    // floors in the payer's favor, so the ceil can overshoot by a unit
    let mut input = ((gross * PPM as u128 + denom - 1) / denom) as u64;
    while input > 0 && output_for_input(input - 1, base_fee, fee_ppm) >= amount_out {
        input -= 1;
    }
    input
}

/// Fee schedule the intermediary quoted for this swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapFees {
    /// Flat component, input units
    pub base: u64,
    /// Proportional component, parts per million of the input
    pub ppm: u64,
    /// Network (miner / routing) fee passed through by the intermediary
    pub network: u64,
}

impl SwapFees {
    pub fn total_for(&self, amount_in: u64) -> u64 {
        total_fee(amount_in, self.base, self.ppm).saturating_add(self.network)
    }
}

/// Immutable pricing snapshot taken when the quote was accepted.
/// `swap_ppm` is the realized price in output units per million input
/// units; `market_ppm` is the reference price at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    pub swap_ppm: u64,
    pub market_ppm: u64,
    pub valid: bool,
}

impl PriceInfo {
    pub fn new(amount_in_without_fee: u64, amount_out: u64) -> Self {
        let swap_ppm = if amount_in_without_fee == 0 {
            0
        } else {
            ((amount_out as u128 * PPM as u128) / amount_in_without_fee as u128) as u64
        };
        PriceInfo {
            swap_ppm,
            market_ppm: 0,
            valid: false,
        }
    }

    /// Re-check the quoted price against a fresh market price
    pub fn revalidate(&mut self, market_ppm: u64, tolerance_ppm: u64) -> bool {
        self.market_ppm = market_ppm;
        self.valid = within_tolerance(self.swap_ppm, market_ppm, tolerance_ppm);
        self.valid
    }
}

/// True when `quoted` deviates from `market` by at most
/// `tolerance_ppm` parts per million of the market price
pub fn within_tolerance(quoted: u64, market: u64, tolerance_ppm: u64) -> bool {
    if market == 0 {
        return false;
    }
    let diff = quoted.abs_diff(market) as u128;
    diff * PPM as u128 <= market as u128 * tolerance_ppm as u128
}
