//! Exit condition evaluation for an open position.
//!
//! Evaluates take-profit, hard stop-loss, and the optional trailing
//! stop on every price observation. The trailing stop ratchets
//! monotonically: it tightens as profit grows and never loosens.

use ladder_core::{PositionSide, Price};
use rust_decimal::Decimal;
use std::fmt;
use tracing::debug;

/// Trailing stop settings.
#[derive(Debug, Clone)]
pub struct TrailingConfig {
    /// Profit percent at which the trailing stop activates.
    pub activation_pct: Decimal,
    /// Distance of the stop below/above the current price, in percent.
    pub distance_pct: Decimal,
}

/// Exit thresholds for one cycle.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Profit percent that closes the position.
    pub take_profit_pct: Decimal,
    /// Adverse move percent that closes the position.
    pub stop_loss_pct: Decimal,
    /// Optional trailing stop.
    pub trailing: Option<TrailingConfig>,
}

/// Why the position is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitSignal {
    TakeProfit { profit_pct: Decimal },
    StopLoss { stop_price: Price },
    TrailingStop { stop_price: Price },
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeProfit { profit_pct } => write!(f, "take-profit at {profit_pct}%"),
            Self::StopLoss { stop_price } => write!(f, "stop-loss at {stop_price}"),
            Self::TrailingStop { stop_price } => write!(f, "trailing-stop at {stop_price}"),
        }
    }
}

/// Evaluates exit conditions for one open position.
#[derive(Debug)]
pub struct ExitEvaluator {
    config: ExitConfig,
    side: PositionSide,
    entry_price: Price,
    /// Ratcheted trailing stop price, once activated.
    trailing_stop: Option<Price>,
}

impl ExitEvaluator {
    pub fn new(config: ExitConfig, side: PositionSide, entry_price: Price) -> Self {
        Self {
            config,
            side,
            entry_price,
            trailing_stop: None,
        }
    }

    /// Refresh the entry price after additional fills. The trailing
    /// ratchet is intentionally left untouched.
    pub fn update_entry(&mut self, entry_price: Price) {
        self.entry_price = entry_price;
    }

    pub fn entry_price(&self) -> Price {
        self.entry_price
    }

    pub fn trailing_stop(&self) -> Option<Price> {
        self.trailing_stop
    }

    /// Evaluate exit conditions at `current`.
    pub fn on_price(&mut self, current: Price) -> Option<ExitSignal> {
        let sign = Decimal::from(self.side.sign());
        let profit_pct = current.pct_from(self.entry_price)? * sign;

        if profit_pct >= self.config.take_profit_pct {
            return Some(ExitSignal::TakeProfit { profit_pct });
        }

        if let Some(stop_price) = self.ratchet_trailing(current, profit_pct) {
            if self.crossed(current, stop_price) {
                return Some(ExitSignal::TrailingStop { stop_price });
            }
        }

        let stop_price = self
            .entry_price
            .offset_pct(-sign * self.config.stop_loss_pct);
        if self.crossed(current, stop_price) {
            return Some(ExitSignal::StopLoss { stop_price });
        }

        None
    }

    /// Advance the trailing stop, tightening only.
    fn ratchet_trailing(&mut self, current: Price, profit_pct: Decimal) -> Option<Price> {
        let trailing = self.config.trailing.as_ref()?;

        if profit_pct >= trailing.activation_pct {
            let sign = Decimal::from(self.side.sign());
            let candidate = current.offset_pct(-sign * trailing.distance_pct);
            let tightened = match (self.trailing_stop, self.side) {
                (Some(existing), PositionSide::Long) => existing.max(candidate),
                (Some(existing), PositionSide::Short) => existing.min(candidate),
                (None, _) => candidate,
            };
            if Some(tightened) != self.trailing_stop {
                debug!(stop = %tightened, "Trailing stop ratcheted");
            }
            self.trailing_stop = Some(tightened);
        }

        self.trailing_stop
    }

    /// Check whether `current` crossed the adverse side of `threshold`.
    fn crossed(&self, current: Price, threshold: Price) -> bool {
        match self.side {
            PositionSide::Long => current <= threshold,
            PositionSide::Short => current >= threshold,
        }
    }
}
