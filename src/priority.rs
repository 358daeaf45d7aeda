//! Priority scoring and fee estimation (spec §4.2).

use std::time::{Duration, Instant};

use crate::types::{Transaction, TxType};

/// Estimates the fee for a transaction from its size and a base per-byte
/// rate (the configured `price_limit`), bumped for extra inputs/outputs and
/// floored at 10_000 units. Coinbase transactions always estimate to 0 and
/// are exempt from minimum-fee checks (spec §4.2).
pub fn estimate_fee(tx: &Transaction, size: u64, price_limit: u64) -> u64 {
    if tx.is_coinbase() {
        return 0;
    }
    let base = size.saturating_mul(price_limit.max(1));
    let extra_inputs = tx.inputs.len().saturating_sub(1) as u64;
    let extra_outputs = tx.outputs.len().saturating_sub(1) as u64;
    // +5% per extra input, +3% per extra output, applied additively to base.
    let bumped = base
        + (base * extra_inputs * 5) / 100
        + (base * extra_outputs * 3) / 100;
    bumped.max(10_000).max(tx.fee_mechanism)
}

fn type_bonus(tx_type: TxType) -> i64 {
    match tx_type {
        TxType::System => 10_000,
        TxType::Contract => 5_000,
        TxType::Resource => 2_000,
        TxType::Normal => 0,
    }
}

/// Computes the scalar priority for a Pending entry (spec §4.2). The five
/// weighted terms are fixed design constants, not runtime config.
pub fn compute_priority(
    estimated_fee: u64,
    size: u64,
    tx_type: TxType,
    received_at: Instant,
    now: Instant,
) -> i32 {
    let fee_score = ((estimated_fee / 1000).min(60_000) as f64) * 0.60;

    let fee_rate_score = if size > 0 {
        let rate = (estimated_fee as f64 * 10_000.0 / size as f64) / 100.0;
        rate.min(5_000.0)
    } else {
        0.0
    };

    let age = now.saturating_duration_since(received_at);
    let age_score = age_score(age);

    let size_score = if size < 10_000 {
        (10_000 - size) as f64 * 0.10
    } else {
        0.0
    };

    let total = fee_score + fee_rate_score + age_score + size_score + type_bonus(tx_type) as f64;

    (total.round() as i64).clamp(1, i32::MAX as i64) as i32
}

fn age_score(age: Duration) -> f64 {
    let secs = age.as_secs();
    if secs < 3600 {
        (3600 - secs) as f64 * 0.30
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn coinbase_fee_is_zero() {
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![crate::types::TxOutput { payload: vec![] }],
            nonce: 0,
            metadata: vec![],
            fee_mechanism: 0,
        };
        assert_eq!(estimate_fee(&tx, 500, 1000), 0);
    }

    #[test]
    fn fee_estimate_floors_at_10000() {
        let tx = Transaction {
            inputs: vec![crate::types::TxInput {
                previous_output: crate::types::OutPoint {
                    tx_id: crate::types::TxId([0u8; 32]),
                    output_index: 0,
                },
                is_reference_only: false,
            }],
            outputs: vec![crate::types::TxOutput { payload: vec![] }],
            nonce: 0,
            metadata: vec![],
            fee_mechanism: 0,
        };
        assert_eq!(estimate_fee(&tx, 1, 1), 10_000);
    }

    #[test]
    fn priority_is_clamped_and_monotone_in_fee() {
        let now = Instant::now();
        let low = compute_priority(10_000, 500, TxType::Normal, now, now);
        let high = compute_priority(60_000, 500, TxType::Normal, now, now);
        assert!(high > low);
        assert!(low >= 1);
    }

    #[test]
    fn type_bonus_dominates_for_system_tx() {
        let now = Instant::now();
        let normal = compute_priority(10_000, 500, TxType::Normal, now, now);
        let system = compute_priority(10_000, 500, TxType::System, now, now);
        assert_eq!(system - normal, 10_000);
    }

    #[test]
    fn age_score_decays_to_zero_after_an_hour() {
        let now = Instant::now();
        let old = now + Duration::from_secs(3601);
        let p_fresh = compute_priority(10_000, 20_000, TxType::Normal, now, now);
        let p_old = compute_priority(10_000, 20_000, TxType::Normal, now, old);
        assert!(p_fresh > p_old);
    }
}
