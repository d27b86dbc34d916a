//! Pricing Engine: cart lines to subtotal, tax, shipping and total.
//!
//! Pure and deterministic. All amounts are `Decimal`; the only rounding is
//! the order-level tax (and the subtotal, which is already exact for prices
//! quoted in cents), half-to-even at two places.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::errors::ServiceError;
use crate::models::{OrderLine, OrderTotals};

const MONEY_SCALE: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PricingPolicy {
    pub tax_rate: Decimal,
    /// Subtotals strictly above this ship free.
    pub free_shipping_threshold: Decimal,
    pub flat_shipping_fee: Decimal,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.08),
            free_shipping_threshold: dec!(50.00),
            flat_shipping_fee: dec!(9.99),
        }
    }
}

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven)
}

impl PricingPolicy {
    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.flat_shipping_fee
        }
    }

    pub fn price(&self, items: &[OrderLine]) -> OrderTotals {
        let subtotal = round_money(items.iter().map(OrderLine::line_total).sum());
        let tax = round_money(subtotal * self.tax_rate);
        let shipping = self.shipping_for(subtotal);

        OrderTotals {
            subtotal,
            tax,
            shipping,
            total: subtotal + tax + shipping,
        }
    }
}

/// Amount in the currency's minor unit (cents), as the gateway and the
/// relational store expect it.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(cents: i64) -> Decimal {
    Decimal::new(cents, MONEY_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn line(price: Decimal, quantity: u32) -> OrderLine {
        OrderLine {
            product_id: Uuid::new_v4(),
            name: "item".into(),
            size: None,
            sku: None,
            quantity,
            unit_price: price,
        }
    }

    #[test]
    fn single_tee_under_threshold() {
        let totals = PricingPolicy::default().price(&[line(dec!(29.99), 1)]);
        assert_eq!(totals.subtotal, dec!(29.99));
        assert_eq!(totals.tax, dec!(2.40));
        assert_eq!(totals.shipping, dec!(9.99));
        assert_eq!(totals.total, dec!(42.38));
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let policy = PricingPolicy::default();
        assert_eq!(policy.price(&[line(dec!(50.00), 1)]).shipping, dec!(9.99));
        assert_eq!(policy.price(&[line(dec!(25.01), 2)]).shipping, Decimal::ZERO);
    }

    #[test]
    fn tax_rounds_half_to_even_once_per_order() {
        let policy = PricingPolicy {
            tax_rate: dec!(0.1),
            ..PricingPolicy::default()
        };
        assert_eq!(policy.price(&[line(dec!(0.25), 1)]).tax, dec!(0.02));
        assert_eq!(policy.price(&[line(dec!(0.35), 1)]).tax, dec!(0.04));

        // per-line rounding would give 0.02 + 0.02; order-level gives 0.05
        let two_lines = policy.price(&[line(dec!(0.25), 1), line(dec!(0.25), 1)]);
        assert_eq!(two_lines.tax, dec!(0.05));
    }

    #[test]
    fn minor_units_round_trip() {
        assert_eq!(to_minor_units(dec!(42.38)).unwrap(), 4238);
        assert_eq!(to_minor_units(dec!(0.5)).unwrap(), 50);
        assert_eq!(from_minor_units(999), dec!(9.99));
    }
}
