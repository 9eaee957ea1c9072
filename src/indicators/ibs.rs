/// Calculate Internal Bar Strength (IBS)
///
/// IBS measures where the close sits within the bar's range:
/// 0.0 = close at the low, 1.0 = close at the high.
///
/// A degenerate bar (high == low) has no range to measure against and is
/// defined as 0.5, i.e. neutral / no signal. The result is clamped to
/// [0, 1] so malformed candles cannot produce out-of-range values.
pub fn calculate_ibs(close: f64, low: f64, high: f64) -> f64 {
    if high == low {
        return 0.5;
    }
    let ibs = (close - low) / (high - low);
    ibs.clamp(0.0, 1.0)
}

/// Scale leverage from IBS: the deeper the close sits in the bar's range,
/// the more leverage is applied.
///
/// `leverage = base * (1 - ibs)^exponent`, rounded to the nearest whole
/// step and clamped to [1, base]. Clamping happens after the rounding so a
/// fractional base can never be exceeded by rounding up.
pub fn determine_leverage(ibs: f64, base: f64, exponent: f64) -> f64 {
    let leverage = (base * (1.0 - ibs).powf(exponent)).round();
    leverage.clamp(1.0, base)
}
