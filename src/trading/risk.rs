//! Stop placement, lot sizing and the portfolio risk budget.
//!
//! Prices and money are `Decimal`. Pip sizes depend only on the symbol name:
//! JPY-quoted pairs and gold use 0.01, everything else 0.0001.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::warn;

use super::config::RiskConfig;
use super::trailing_stop::TrackedPosition;
use crate::error::RiskRejection;
use crate::models::Side;

/// Lot size returned when no usable stop distance exists.
pub const DEFAULT_FALLBACK_LOT: Decimal = dec!(0.1);

const HUNDRED: Decimal = dec!(100);

pub fn is_jpy_pair(symbol: &str) -> bool {
    symbol.to_uppercase().contains("JPY")
}

pub fn is_gold(symbol: &str) -> bool {
    let symbol = symbol.to_uppercase();
    symbol.contains("XAU") || symbol.contains("GOLD")
}

/// Conventional pip size for a symbol.
pub fn pip_size(symbol: &str) -> Decimal {
    if is_jpy_pair(symbol) || is_gold(symbol) {
        dec!(0.01)
    } else {
        dec!(0.0001)
    }
}

/// ATR-based stop: below entry for longs, above for shorts.
pub fn calc_stop_loss(entry: Decimal, atr: Decimal, multiplier: Decimal, side: Side) -> Decimal {
    entry - side.sign() * multiplier * atr
}

/// Stop a fixed number of pips away from entry.
pub fn calc_fixed_stop_loss(entry: Decimal, pips: Decimal, side: Side, pip_size: Decimal) -> Decimal {
    entry - side.sign() * pips * pip_size
}

/// Reward per unit of risk. `None` when the stop sits at entry.
pub fn risk_reward_ratio(entry: Decimal, stop: Decimal, take_profit: Decimal) -> Option<Decimal> {
    let risk = (entry - stop).abs();
    if risk.is_zero() {
        return None;
    }
    Some((take_profit - entry).abs() / risk)
}

/// Stop is on the losing side of entry and at least `min_distance` away.
pub fn validate_stop_loss(entry: Decimal, stop: Decimal, side: Side, min_distance: Decimal) -> bool {
    let on_loss_side = match side {
        Side::Buy => stop < entry,
        Side::Sell => stop > entry,
    };
    on_loss_side && (entry - stop).abs() >= min_distance
}

/// Fixed-fraction lot size.
///
/// risk amount = balance x risk% / 100; lots = risk amount / (stop distance x
/// contract size), rounded to 0.01 and clamped to `[min_lot, max_lot]`.
/// A non-positive stop distance yields [`DEFAULT_FALLBACK_LOT`], clamped.
pub fn calc_position_size(
    balance: Decimal,
    risk_percent: Decimal,
    stop_distance: Decimal,
    contract_size: Decimal,
    min_lot: Decimal,
    max_lot: Decimal,
) -> Decimal {
    if stop_distance <= Decimal::ZERO || contract_size <= Decimal::ZERO {
        return DEFAULT_FALLBACK_LOT.clamp(min_lot, max_lot);
    }

    let risk_amount = balance * risk_percent / HUNDRED;
    let size = risk_amount / (stop_distance * contract_size);
    size.round_dp(2).clamp(min_lot, max_lot)
}

/// Outcome of [`DynamicSizer::size`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingDecision {
    pub lots: Decimal,
    /// Risk percent actually used after the per-trade cap
    pub effective_risk_percent: Decimal,
    pub risk_capped: bool,
    /// Exposure-based ceiling before rounding
    pub dynamic_max_lots: Decimal,
    pub risk_amount: Decimal,
    pub stop_pips: Decimal,
    /// Account-currency value of one pip for one lot
    pub pip_value: Decimal,
    /// No usable stop distance; fallback lot used
    pub fallback: bool,
}

/// Risk-capped sizing with an exposure ceiling that scales with balance.
#[derive(Debug, Clone)]
pub struct DynamicSizer {
    config: RiskConfig,
}

impl DynamicSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Account-currency value of one pip on one lot.
    ///
    /// JPY-quoted pairs are converted at the entry price; every other symbol is
    /// assumed to be quoted in the account currency.
    pub fn pip_value_per_lot(symbol: &str, entry: Decimal, contract_size: Decimal) -> Decimal {
        let raw = pip_size(symbol) * contract_size;
        if is_jpy_pair(symbol) && entry > Decimal::ZERO {
            raw / entry
        } else {
            raw
        }
    }

    /// Account-currency notional of one lot.
    ///
    /// For JPY-quoted pairs the base currency is the account currency, so one
    /// lot is worth its contract size.
    pub fn notional_per_lot(symbol: &str, entry: Decimal, contract_size: Decimal) -> Decimal {
        if is_jpy_pair(symbol) || entry <= Decimal::ZERO {
            contract_size
        } else {
            contract_size * entry
        }
    }

    /// Lots for an entry at `entry` with the stop `stop_distance` away.
    pub fn size(
        &self,
        symbol: &str,
        balance: Decimal,
        entry: Decimal,
        stop_distance: Decimal,
        contract_size: Decimal,
    ) -> SizingDecision {
        let requested = self.config.risk_per_trade_percent;
        let cap = self.config.max_risk_per_trade_percent;
        let risk_capped = requested > cap;
        let effective_risk_percent = requested.min(cap);

        if risk_capped {
            warn!(
                requested = %requested,
                cap = %cap,
                "Per-trade risk capped"
            );
        }

        let risk_amount = balance * effective_risk_percent / HUNDRED;
        let pip = pip_size(symbol);
        let stop_pips = stop_distance / pip;
        let pip_value = Self::pip_value_per_lot(symbol, entry, contract_size);

        let notional = Self::notional_per_lot(symbol, entry, contract_size);
        let dynamic_max_lots = if notional > Decimal::ZERO {
            balance * self.config.max_exposure_percent / HUNDRED / notional
        } else {
            Decimal::ZERO
        };

        let fallback = stop_pips <= Decimal::ZERO || pip_value <= Decimal::ZERO;
        let raw = if fallback {
            self.config.fallback_lot
        } else {
            (risk_amount / (stop_pips * pip_value)).min(dynamic_max_lots)
        };

        let mut lots = raw.round_dp(2).max(self.config.min_lot);
        if let Some(max_lot) = self.config.max_lot {
            lots = lots.min(max_lot);
        }

        SizingDecision {
            lots,
            effective_risk_percent,
            risk_capped,
            dynamic_max_lots,
            risk_amount,
            stop_pips,
            pip_value,
            fallback,
        }
    }
}

/// Result of a portfolio budget check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskCheck {
    pub allowed: bool,
    pub current_risk_percent: Decimal,
    pub proposed_risk_percent: Decimal,
    pub max_total_risk_percent: Decimal,
    pub reason: String,
}

impl RiskCheck {
    pub fn rejection(&self) -> Option<RiskRejection> {
        (!self.allowed).then(|| RiskRejection {
            current_risk_percent: self.current_risk_percent,
            proposed_risk_percent: self.proposed_risk_percent,
            max_total_risk_percent: self.max_total_risk_percent,
            reason: self.reason.clone(),
        })
    }
}

/// Reject iff `current + proposed > max`. A proposal is never resized.
pub fn can_open_position(current_percent: Decimal, proposed_percent: Decimal, max_total_percent: Decimal) -> RiskCheck {
    let total = current_percent + proposed_percent;
    let allowed = total <= max_total_percent;
    let reason = if allowed {
        format!(
            "Portfolio risk {:.2}% + {:.2}% within limit {:.2}%",
            current_percent, proposed_percent, max_total_percent
        )
    } else {
        format!(
            "Portfolio risk {:.2}% + {:.2}% = {:.2}% exceeds limit {:.2}%",
            current_percent, proposed_percent, total, max_total_percent
        )
    };

    RiskCheck {
        allowed,
        current_risk_percent: current_percent,
        proposed_risk_percent: proposed_percent,
        max_total_risk_percent: max_total_percent,
        reason,
    }
}

/// Portfolio-wide risk budget over the tracked positions.
#[derive(Debug, Clone)]
pub struct RiskManager {
    max_total_risk_percent: Decimal,
}

impl RiskManager {
    pub fn new(max_total_risk_percent: Decimal) -> Self {
        Self { max_total_risk_percent }
    }

    /// Account-currency loss if `stop` is hit.
    ///
    /// Only the adverse distance counts: a stop at or beyond entry in the
    /// profitable direction carries no risk.
    pub fn position_risk(
        symbol: &str,
        side: Side,
        entry: Decimal,
        stop: Decimal,
        volume: Decimal,
        contract_size: Decimal,
    ) -> Decimal {
        let adverse = ((entry - stop) * side.sign()).max(Decimal::ZERO);
        let pip = pip_size(symbol);
        let stop_pips = adverse / pip;

        let mut risk = stop_pips * pip * contract_size * volume;
        if is_jpy_pair(symbol) && entry > Decimal::ZERO {
            risk /= entry;
        }
        risk
    }

    /// Risk of one position as percent of `balance`.
    pub fn risk_percent(amount: Decimal, balance: Decimal) -> Decimal {
        if balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        amount / balance * HUNDRED
    }

    /// Sum of open risk across `positions`, as percent of `balance`.
    pub fn portfolio_risk<'a>(
        &self,
        positions: impl IntoIterator<Item = &'a TrackedPosition>,
        contract_size: Decimal,
        balance: Decimal,
    ) -> Decimal {
        let total: Decimal = positions
            .into_iter()
            .map(|p| Self::position_risk(&p.symbol, p.side, p.entry_price, p.current_stop, p.volume, contract_size))
            .sum();
        Self::risk_percent(total, balance)
    }

    pub fn can_open_position(&self, current_percent: Decimal, proposed_percent: Decimal) -> RiskCheck {
        can_open_position(current_percent, proposed_percent, self.max_total_risk_percent)
    }

    pub fn max_total_risk_percent(&self) -> Decimal {
        self.max_total_risk_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;
    use crate::trading::trailing_stop::{TrailingStopManager, TrailingStopParams};
    use chrono::Utc;

    #[test]
    fn test_pip_size_lookup() {
        assert_eq!(pip_size("EURUSD"), dec!(0.0001));
        assert_eq!(pip_size("usdjpy"), dec!(0.01));
        assert_eq!(pip_size("EURJPY.m"), dec!(0.01));
        assert_eq!(pip_size("XAUUSD"), dec!(0.01));
        assert_eq!(pip_size("GOLD"), dec!(0.01));
        assert_eq!(pip_size("GBPUSD"), dec!(0.0001));
    }

    #[test]
    fn test_stop_loss_by_side() {
        assert_eq!(calc_stop_loss(dec!(1.2500), dec!(0.0010), dec!(2), Side::Buy), dec!(1.2480));
        assert_eq!(calc_stop_loss(dec!(1.2500), dec!(0.0010), dec!(2), Side::Sell), dec!(1.2520));
        assert_eq!(
            calc_fixed_stop_loss(dec!(150.00), dec!(30), Side::Sell, pip_size("USDJPY")),
            dec!(150.30)
        );
    }

    #[test]
    fn test_stop_helpers() {
        assert_eq!(risk_reward_ratio(dec!(1.1000), dec!(1.0980), dec!(1.1040)), Some(dec!(2)));
        assert_eq!(risk_reward_ratio(dec!(1.1000), dec!(1.1000), dec!(1.1040)), None);

        assert!(validate_stop_loss(dec!(1.1000), dec!(1.0980), Side::Buy, dec!(0.0010)));
        assert!(!validate_stop_loss(dec!(1.1000), dec!(1.0995), Side::Buy, dec!(0.0010)));
        assert!(!validate_stop_loss(dec!(1.1000), dec!(1.1020), Side::Buy, Decimal::ZERO));
        assert!(validate_stop_loss(dec!(1.1000), dec!(1.1020), Side::Sell, Decimal::ZERO));
    }

    #[test]
    fn test_position_size() {
        // 100 risk / (0.0020 x 100000) = 0.5 lots
        let size = calc_position_size(dec!(10000), dec!(1), dec!(0.0020), dec!(100000), dec!(0.01), dec!(10));
        assert_eq!(size, dec!(0.50));
    }

    #[test]
    fn test_position_size_clamped() {
        let tiny = calc_position_size(dec!(100), dec!(1), dec!(0.0100), dec!(100000), dec!(0.01), dec!(10));
        assert_eq!(tiny, dec!(0.01));

        let huge = calc_position_size(dec!(10000000), dec!(5), dec!(0.0001), dec!(100000), dec!(0.01), dec!(10));
        assert_eq!(huge, dec!(10));
    }

    #[test]
    fn test_position_size_fallback() {
        let size = calc_position_size(dec!(10000), dec!(1), Decimal::ZERO, dec!(100000), dec!(0.01), dec!(10));
        assert_eq!(size, DEFAULT_FALLBACK_LOT);

        let size = calc_position_size(dec!(10000), dec!(1), dec!(-0.001), dec!(100000), dec!(0.5), dec!(10));
        assert_eq!(size, dec!(0.5));
    }

    #[test]
    fn test_dynamic_sizer_non_jpy() {
        let sizer = DynamicSizer::new(RiskConfig::default());
        let decision = sizer.size("EURUSD", dec!(10000), dec!(1.1000), dec!(0.0020), dec!(100000));

        assert_eq!(decision.stop_pips, dec!(20));
        assert_eq!(decision.pip_value, dec!(10));
        assert_eq!(decision.risk_amount, dec!(100));
        assert_eq!(decision.lots, dec!(0.50));
        assert!(!decision.risk_capped);
    }

    #[test]
    fn test_dynamic_sizer_jpy() {
        let sizer = DynamicSizer::new(RiskConfig::default());
        let decision = sizer.size("USDJPY", dec!(10000), dec!(150.00), dec!(0.30), dec!(100000));

        // One pip on one lot is 1000 JPY, about 6.67 USD at 150
        assert_eq!(decision.stop_pips, dec!(30));
        assert_eq!(decision.pip_value.round_dp(4), dec!(6.6667));
        assert_eq!(decision.lots, dec!(0.50));
        // 10000 x 1000% / 100000 USD per lot
        assert_eq!(decision.dynamic_max_lots, dec!(1));
    }

    #[test]
    fn test_dynamic_sizer_caps_risk() {
        let sizer = DynamicSizer::new(RiskConfig {
            risk_per_trade_percent: dec!(5),
            max_exposure_percent: dec!(5000),
            ..Default::default()
        });
        let decision = sizer.size("EURUSD", dec!(10000), dec!(1.1000), dec!(0.0020), dec!(100000));

        assert!(decision.risk_capped);
        assert_eq!(decision.effective_risk_percent, dec!(2.0));
        assert_eq!(decision.lots, dec!(1.00));
    }

    #[test]
    fn test_dynamic_sizer_exposure_ceiling() {
        let sizer = DynamicSizer::new(RiskConfig {
            risk_per_trade_percent: dec!(2),
            ..Default::default()
        });
        // Risk alone would allow 0.4 lots; exposure caps at 1000 x 10 / 110000
        let decision = sizer.size("EURUSD", dec!(1000), dec!(1.1000), dec!(0.0005), dec!(100000));
        assert_eq!(decision.lots, dec!(0.09));
    }

    #[test]
    fn test_dynamic_sizer_absolute_ceiling_and_fallback() {
        let sizer = DynamicSizer::new(RiskConfig {
            max_lot: Some(dec!(0.2)),
            ..Default::default()
        });
        let decision = sizer.size("EURUSD", dec!(10000), dec!(1.1000), dec!(0.0020), dec!(100000));
        assert_eq!(decision.lots, dec!(0.2));

        let decision = sizer.size("EURUSD", dec!(10000), dec!(1.1000), Decimal::ZERO, dec!(100000));
        assert!(decision.fallback);
        assert_eq!(decision.lots, dec!(0.1));
    }

    #[test]
    fn test_can_open_position_boundary() {
        assert!(can_open_position(dec!(4), dec!(2), dec!(6)).allowed);

        let check = can_open_position(dec!(4.5), dec!(2), dec!(6));
        assert!(!check.allowed);
        let rejection = check.rejection().unwrap();
        assert_eq!(rejection.current_risk_percent, dec!(4.5));
        assert_eq!(rejection.proposed_risk_percent, dec!(2));
        assert!(rejection.reason.contains("exceeds"));
    }

    #[test]
    fn test_position_risk_adverse_only() {
        let risk = RiskManager::position_risk("EURUSD", Side::Buy, dec!(1.2500), dec!(1.2480), dec!(0.5), dec!(100000));
        assert_eq!(risk, dec!(100));

        // Stop beyond entry in profit: nothing at risk
        let risk = RiskManager::position_risk("EURUSD", Side::Buy, dec!(1.2500), dec!(1.2510), dec!(0.5), dec!(100000));
        assert_eq!(risk, Decimal::ZERO);

        let risk = RiskManager::position_risk("USDJPY", Side::Sell, dec!(150.00), dec!(150.30), dec!(1), dec!(100000));
        assert_eq!(risk, dec!(200));
    }

    #[test]
    fn test_portfolio_risk() {
        let manager = TrailingStopManager::new(TrailingStopParams::default());
        let open = |ticket, side| Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(0.5),
            entry_price: dec!(1.2500),
            stop_loss: None,
            open_time: Utc::now(),
        };
        let a = manager.initialize(&open(1, Side::Buy), dec!(1.2500), dec!(0.0010));
        let b = manager.initialize(&open(2, Side::Sell), dec!(1.2500), dec!(0.0010));

        // Each risks 0.0020 x 100000 x 0.5 = 100 on a 10000 balance
        let risk = RiskManager::new(dec!(6)).portfolio_risk([&a, &b], dec!(100000), dec!(10000));
        assert_eq!(risk, dec!(2));
    }
}
