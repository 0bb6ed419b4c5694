//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(1000), dec!(4)), dec!(250));
        assert_eq!(safe_div(dec!(1000), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(dec!(0.0156249), 6), dec!(0.015625));
        assert_eq!(round_to_precision(dec!(333.333333), 2), dec!(333.33));
    }
}
