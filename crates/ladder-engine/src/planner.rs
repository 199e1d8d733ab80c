//! Order ladder planning.
//!
//! Pure computation: given a price, a side, and the ladder parameters,
//! produce the priced, sized sequence of entry orders for one cycle.
//! Rung prices are spaced linearly toward the adverse extreme; rung
//! amounts grow geometrically. An empty plan is a valid outcome meaning
//! "cannot trade this cycle".

use ladder_core::{OrderSide, PositionSide, Price, Size};
use rust_decimal::Decimal;

/// Ladder parameters.
#[derive(Debug, Clone)]
pub struct LadderConfig {
    /// Maximum adverse move covered by the ladder, in percent.
    pub max_move_pct: Decimal,
    /// Total quote-currency amount budgeted across all rungs.
    pub total_amount: Decimal,
    /// Number of rungs.
    pub rung_count: u32,
    /// Amount growth per rung, in percent.
    pub increment_pct: Decimal,
    /// Venue minimum notional per order.
    pub min_order_amount: Decimal,
    /// Venue price tick.
    pub price_tick: Decimal,
    /// Venue quantity step.
    pub qty_step: Decimal,
}

/// One entry order in the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderOrder {
    /// Rung index, 0 at the current price.
    pub rung: usize,
    pub price: Price,
    pub quantity: Size,
    /// Effective notional after quantity rounding.
    pub amount: Decimal,
    pub side: OrderSide,
    pub position_side: PositionSide,
}

/// Plan the entry ladder for one cycle.
///
/// Rungs whose rounded amount falls below the venue minimum are dropped
/// entirely, never resized; the achieved total never exceeds
/// `total_amount`.
pub fn plan(current_price: Price, side: PositionSide, config: &LadderConfig) -> Vec<LadderOrder> {
    let n = config.rung_count;
    if n == 0 || !current_price.is_positive() || config.total_amount <= Decimal::ZERO {
        return Vec::new();
    }

    let hundred = Decimal::ONE_HUNDRED;

    // Linear spacing: long ladders step down into the dip, short up.
    let direction = -Decimal::from(side.sign());
    let span = config.max_move_pct / hundred;
    let step = if n > 1 {
        span / Decimal::from(n - 1)
    } else {
        Decimal::ZERO
    };

    // Geometric sizing: solve the base rung from the series sum, then
    // clamp up to the venue minimum.
    let growth_ratio = Decimal::ONE + config.increment_pct / hundred;
    let mut base = base_amount(config.total_amount, growth_ratio, n);
    if base < config.min_order_amount {
        base = config.min_order_amount;
    }

    let mut amounts = Vec::with_capacity(n as usize);
    let mut achieved = Decimal::ZERO;
    let mut growth = Decimal::ONE;
    for _ in 0..n {
        let amount = base * growth;
        achieved += amount;
        amounts.push(amount);
        growth *= growth_ratio;
    }

    // Clamping can overshoot the budget: downscale once, never up.
    if achieved > config.total_amount {
        let scale = config.total_amount / achieved;
        for amount in amounts.iter_mut() {
            *amount *= scale;
        }
    }

    let tick = Price::new(config.price_tick);
    let qty_step = Size::new(config.qty_step);
    let mut orders = Vec::with_capacity(n as usize);

    for (i, amount) in amounts.into_iter().enumerate() {
        let offset = Decimal::ONE + direction * step * Decimal::from(i as u32);
        let rung_price = Price::new(current_price.inner() * offset).round_to_tick(tick);
        if !rung_price.is_positive() {
            continue;
        }

        let quantity = Size::new(amount / rung_price.inner()).round_to_step(qty_step);
        let effective = quantity.notional(rung_price);
        if effective < config.min_order_amount {
            continue;
        }

        orders.push(LadderOrder {
            rung: i,
            price: rung_price,
            quantity,
            amount: effective,
            side: side.entry_side(),
            position_side: side,
        });
    }

    orders
}

/// Base rung amount from the geometric series closed form:
/// `total * (r - 1) / (r^n - 1)`, degenerating to `total / n` when the
/// growth ratio is 1.
fn base_amount(total: Decimal, ratio: Decimal, n: u32) -> Decimal {
    if ratio == Decimal::ONE {
        return total / Decimal::from(n);
    }
    let mut ratio_pow_n = Decimal::ONE;
    for _ in 0..n {
        ratio_pow_n *= ratio;
    }
    total * (ratio - Decimal::ONE) / (ratio_pow_n - Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> LadderConfig {
        LadderConfig {
            max_move_pct: dec!(3),
            total_amount: dec!(100),
            rung_count: 3,
            increment_pct: dec!(50),
            min_order_amount: dec!(10),
            price_tick: dec!(0.01),
            qty_step: dec!(0.001),
        }
    }

    #[test]
    fn test_worked_example_prices_and_ratio() {
        let orders = plan(Price::new(dec!(100)), PositionSide::Long, &config());

        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].price, Price::new(dec!(100.00)));
        assert_eq!(orders[1].price, Price::new(dec!(98.50)));
        assert_eq!(orders[2].price, Price::new(dec!(97.00)));

        // Amounts follow the 1 : 1.5 : 2.25 ratio within rounding noise.
        let ratio_1 = orders[1].amount / orders[0].amount;
        let ratio_2 = orders[2].amount / orders[1].amount;
        assert!((ratio_1 - dec!(1.5)).abs() < dec!(0.02), "ratio_1 = {ratio_1}");
        assert!((ratio_2 - dec!(1.5)).abs() < dec!(0.02), "ratio_2 = {ratio_2}");

        for order in &orders {
            assert_eq!(order.side, OrderSide::Buy);
            assert_eq!(order.position_side, PositionSide::Long);
        }
    }

    #[test]
    fn test_amounts_never_exceed_total() {
        for increment in [dec!(0), dec!(25), dec!(50), dec!(100)] {
            let cfg = LadderConfig {
                increment_pct: increment,
                ..config()
            };
            let orders = plan(Price::new(dec!(100)), PositionSide::Long, &cfg);
            let sum: Decimal = orders.iter().map(|o| o.amount).sum();
            assert!(sum <= cfg.total_amount, "sum {sum} over budget at r={increment}");
            for order in &orders {
                assert!(order.amount >= cfg.min_order_amount);
            }
        }
    }

    #[test]
    fn test_prices_monotonic_and_evenly_spaced() {
        let cfg = LadderConfig {
            rung_count: 5,
            qty_step: dec!(0.0001),
            min_order_amount: dec!(5),
            ..config()
        };
        let orders = plan(Price::new(dec!(200)), PositionSide::Long, &cfg);
        assert_eq!(orders.len(), 5);

        let step = orders[0].price.inner() - orders[1].price.inner();
        for pair in orders.windows(2) {
            let gap = pair[0].price.inner() - pair[1].price.inner();
            assert!(gap > Decimal::ZERO, "prices must fall strictly");
            assert!((gap - step).abs() <= dec!(0.01), "uneven spacing: {gap} vs {step}");
        }
    }

    #[test]
    fn test_short_ladder_steps_up() {
        let orders = plan(Price::new(dec!(100)), PositionSide::Short, &config());

        assert_eq!(orders[0].price, Price::new(dec!(100.00)));
        assert_eq!(orders[1].price, Price::new(dec!(101.50)));
        assert_eq!(orders[2].price, Price::new(dec!(103.00)));
        assert!(orders.iter().all(|o| o.side == OrderSide::Sell));
    }

    #[test]
    fn test_small_budget_yields_empty_plan() {
        let cfg = LadderConfig {
            total_amount: dec!(5),
            min_order_amount: dec!(10),
            increment_pct: dec!(0),
            ..config()
        };
        // Base clamps to the minimum, the downscale pushes every rung
        // back under it, and every rung is dropped.
        let orders = plan(Price::new(dec!(100)), PositionSide::Long, &cfg);
        assert!(orders.is_empty());
    }

    #[test]
    fn test_zero_increment_splits_evenly() {
        let cfg = LadderConfig {
            increment_pct: dec!(0),
            ..config()
        };
        let orders = plan(Price::new(dec!(100)), PositionSide::Long, &cfg);
        assert_eq!(orders.len(), 3);

        let first = orders[0].amount;
        for order in &orders {
            assert!((order.amount - first).abs() < dec!(0.5));
        }
    }

    #[test]
    fn test_single_rung() {
        let cfg = LadderConfig {
            rung_count: 1,
            ..config()
        };
        let orders = plan(Price::new(dec!(100)), PositionSide::Long, &cfg);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price, Price::new(dec!(100)));
        assert!(orders[0].amount <= cfg.total_amount);
    }

    #[test]
    fn test_zero_rungs_and_bad_price() {
        let cfg = LadderConfig {
            rung_count: 0,
            ..config()
        };
        assert!(plan(Price::new(dec!(100)), PositionSide::Long, &cfg).is_empty());
        assert!(plan(Price::ZERO, PositionSide::Long, &config()).is_empty());
    }

    #[test]
    fn test_minimum_clamp_with_downscale_keeps_rungs_valid() {
        // Budget small enough that the computed base falls below the
        // minimum but large enough that some rungs survive the scale.
        let cfg = LadderConfig {
            total_amount: dec!(40),
            min_order_amount: dec!(10),
            ..config()
        };
        let orders = plan(Price::new(dec!(100)), PositionSide::Long, &cfg);

        // The first rung scales back under the minimum and is dropped.
        assert_eq!(orders.len(), 2);
        let sum: Decimal = orders.iter().map(|o| o.amount).sum();
        assert!(sum <= dec!(40));
        for order in &orders {
            assert!(order.amount >= dec!(10));
        }
    }
}
