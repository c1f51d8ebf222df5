//! Cost arithmetic for model calls.
//!
//! All ledger amounts are integer micro-units (1e-6 of the configured
//! currency). Per-token prices multiply out to fractional micro-units, so
//! every conversion rounds half-to-even; over thousands of small calls the
//! rounding cancels out instead of drifting one way.

use crate::catalog::ModelDescriptor;

/// Micro-units per major currency unit.
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// Round to the nearest integer, ties to the even neighbor.
pub fn round_half_even(x: f64) -> i64 {
    let floor = x.floor();
    let base = floor as i64;
    let frac = x - floor;
    if frac > 0.5 {
        base + 1
    } else if frac < 0.5 {
        base
    } else if base % 2 == 0 {
        base
    } else {
        base + 1
    }
}

/// Convert a major-unit amount (e.g. a configured dollar limit) to micros.
pub fn to_micros(major: f64) -> i64 {
    round_half_even(major * MICROS_PER_UNIT as f64)
}

/// Micros back to a major-unit float, for display only.
pub fn to_major(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

/// Cost of a call with known token counts.
pub fn cost_micros(model: &ModelDescriptor, input_tokens: u64, output_tokens: u64) -> i64 {
    let raw = input_tokens as f64 * model.price_per_input_token
        + output_tokens as f64 * model.price_per_output_token;
    round_half_even(raw * MICROS_PER_UNIT as f64)
}

/// Rough token count for prompt text. Four characters per token is the
/// usual provider heuristic; close enough for pre-call reservations.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(input_per_1k: f64, output_per_1k: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: "test/model".to_string(),
            provider: "test".to_string(),
            tier: "cheap".to_string(),
            price_per_input_token: input_per_1k / 1000.0,
            price_per_output_token: output_per_1k / 1000.0,
            max_tokens: 1000,
            capability_tags: vec![],
        }
    }

    #[test]
    fn test_round_half_even_ties() {
        assert_eq!(round_half_even(0.5), 0);
        assert_eq!(round_half_even(1.5), 2);
        assert_eq!(round_half_even(2.5), 2);
        assert_eq!(round_half_even(3.5), 4);
        assert_eq!(round_half_even(-2.5), -2);
        assert_eq!(round_half_even(-3.5), -4);
    }

    #[test]
    fn test_round_half_even_plain_cases() {
        assert_eq!(round_half_even(2.4), 2);
        assert_eq!(round_half_even(2.6), 3);
        assert_eq!(round_half_even(0.0), 0);
        assert_eq!(round_half_even(7.0), 7);
    }

    #[test]
    fn test_cost_micros_exact() {
        // 0.15 / 1k input, 0.60 / 1k output: 1000 in + 500 out
        // = 0.15 + 0.30 = 0.45 units = 450_000 micros.
        let m = model(0.15, 0.60);
        assert_eq!(cost_micros(&m, 1000, 500), 450_000);
        assert_eq!(cost_micros(&m, 0, 0), 0);
    }

    #[test]
    fn test_fractional_cost_ties_to_even() {
        // 0.5 micros per input token: 1 token sits exactly on a tie.
        let m = model(0.0005, 0.0);
        assert_eq!(cost_micros(&m, 1, 0), 0); // 0.5 -> 0
        assert_eq!(cost_micros(&m, 3, 0), 2); // 1.5 -> 2
        assert_eq!(cost_micros(&m, 5, 0), 2); // 2.5 -> 2
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_major_unit_conversion() {
        assert_eq!(to_micros(5.0), 5_000_000);
        assert_eq!(to_micros(0.000001), 1);
        assert!((to_major(2_500_000) - 2.5).abs() < 1e-9);
    }
}
