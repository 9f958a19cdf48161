// =============================================================================
// Fee & P&L Accountant — pure, stateless profit arithmetic
// =============================================================================
//
// Converts raw entry/exit prices, quantities, and exchange fees into net
// profit and net profit-percent. Every close path goes through these
// functions exactly once per fee so a trade can never be double-charged or
// under-charged.
//
// Inputs are validated up front; invalid (non-positive) prices or quantities
// are rejected before any other component consumes the numbers.
// =============================================================================

use thiserror::Error;

/// Rejection of invalid accounting inputs. Raised before any side effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccountingError {
    #[error("invalid quantity {0}: must be > 0")]
    InvalidQuantity(f64),
    #[error("invalid price {0}: must be > 0")]
    InvalidPrice(f64),
    #[error("invalid fee {0}: must be >= 0")]
    InvalidFee(f64),
}

fn validate_price(price: f64) -> Result<(), AccountingError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(AccountingError::InvalidPrice(price));
    }
    Ok(())
}

fn validate_qty(qty: f64) -> Result<(), AccountingError> {
    if !qty.is_finite() || qty <= 0.0 {
        return Err(AccountingError::InvalidQuantity(qty));
    }
    Ok(())
}

fn validate_fee(fee: f64) -> Result<(), AccountingError> {
    if !fee.is_finite() || fee < 0.0 {
        return Err(AccountingError::InvalidFee(fee));
    }
    Ok(())
}

/// Net P&L in quote currency:
/// `(exit_price - entry_price) * qty - (entry_fee + exit_fee)`.
pub fn net_pnl(
    entry_price: f64,
    exit_price: f64,
    qty: f64,
    entry_fee: f64,
    exit_fee: f64,
) -> Result<f64, AccountingError> {
    validate_price(entry_price)?;
    validate_price(exit_price)?;
    validate_qty(qty)?;
    validate_fee(entry_fee)?;
    validate_fee(exit_fee)?;

    let gross = (exit_price - entry_price) * qty;
    Ok(gross - (entry_fee + exit_fee))
}

/// Net profit-percent relative to the entry notional:
/// `net / (entry_price * qty) * 100`.
pub fn net_pnl_percent(net: f64, entry_price: f64, qty: f64) -> Result<f64, AccountingError> {
    validate_price(entry_price)?;
    validate_qty(qty)?;
    Ok(net / (entry_price * qty) * 100.0)
}

/// Unrealised profit-percent of an open position at `current_price`,
/// charging the entry fee plus a projected exit fee at `taker_fee_rate` on
/// the exit notional. This is what the Tracker and Underwater policies see.
pub fn unrealized_pnl_percent(
    entry_price: f64,
    current_price: f64,
    qty: f64,
    entry_fee: f64,
    taker_fee_rate: f64,
) -> Result<f64, AccountingError> {
    validate_fee(taker_fee_rate)?;
    let projected_exit_fee = current_price * qty * taker_fee_rate;
    let net = net_pnl(entry_price, current_price, qty, entry_fee, projected_exit_fee)?;
    net_pnl_percent(net, entry_price, qty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_of_fees_round_trip() {
        // $10 gross gain on $100 notional, $0.2 total fees -> 9.8 %.
        let net = net_pnl(100.0, 110.0, 1.0, 0.1, 0.1).unwrap();
        assert!((net - 9.8).abs() < 1e-12);
        let pct = net_pnl_percent(net, 100.0, 1.0).unwrap();
        assert!((pct - 9.8).abs() < 1e-12);
    }

    #[test]
    fn losing_trade_is_negative() {
        let net = net_pnl(45_000.0, 44_990.0, 0.01, 2.0, 0.45).unwrap();
        // Gross -0.10 minus 2.45 in fees.
        assert!(net < 0.0);
        let pct = net_pnl_percent(net, 45_000.0, 0.01).unwrap();
        assert!(pct < 0.0);
    }

    #[test]
    fn fees_charged_exactly_once() {
        let no_fees = net_pnl(100.0, 105.0, 2.0, 0.0, 0.0).unwrap();
        let with_fees = net_pnl(100.0, 105.0, 2.0, 0.3, 0.7).unwrap();
        assert!((no_fees - with_fees - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_positive_quantity() {
        assert_eq!(
            net_pnl(100.0, 110.0, 0.0, 0.0, 0.0),
            Err(AccountingError::InvalidQuantity(0.0))
        );
        assert_eq!(
            net_pnl_percent(1.0, 100.0, -1.0),
            Err(AccountingError::InvalidQuantity(-1.0))
        );
    }

    #[test]
    fn rejects_non_positive_price() {
        assert_eq!(
            net_pnl(0.0, 110.0, 1.0, 0.0, 0.0),
            Err(AccountingError::InvalidPrice(0.0))
        );
        assert_eq!(
            net_pnl(100.0, -5.0, 1.0, 0.0, 0.0),
            Err(AccountingError::InvalidPrice(-5.0))
        );
    }

    #[test]
    fn rejects_negative_fee() {
        assert_eq!(
            net_pnl(100.0, 110.0, 1.0, -0.1, 0.0),
            Err(AccountingError::InvalidFee(-0.1))
        );
    }

    #[test]
    fn rejects_nan_inputs() {
        assert!(net_pnl(f64::NAN, 110.0, 1.0, 0.0, 0.0).is_err());
        assert!(net_pnl(100.0, 110.0, f64::NAN, 0.0, 0.0).is_err());
    }

    #[test]
    fn unrealized_pct_projects_exit_fee() {
        // Entry 100, price 110, qty 1, entry fee 0.1, taker 0.1 % on exit
        // notional (0.11): net = 10 - 0.21 = 9.79 -> 9.79 %.
        let pct = unrealized_pnl_percent(100.0, 110.0, 1.0, 0.1, 0.001).unwrap();
        assert!((pct - 9.79).abs() < 1e-9);
    }
}
