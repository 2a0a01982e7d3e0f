//! Per-model token pricing in USD.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Price per million tokens (input, output) for known model families.
///
/// Matched by prefix so dated snapshots share a row.
const PRICING_PER_MTOK: &[(&str, Decimal, Decimal)] = &[
    ("claude-opus-4", dec!(15), dec!(75)),
    ("claude-sonnet-4", dec!(3), dec!(15)),
    ("claude-3-7-sonnet", dec!(3), dec!(15)),
    ("claude-3-5-sonnet", dec!(3), dec!(15)),
    ("claude-3-5-haiku", dec!(0.80), dec!(4)),
    ("claude-haiku-4", dec!(1), dec!(5)),
    ("gpt-4o-mini", dec!(0.15), dec!(0.60)),
    ("gpt-4o", dec!(2.50), dec!(10)),
    ("gpt-4.1-mini", dec!(0.40), dec!(1.60)),
    ("gpt-4.1", dec!(2), dec!(8)),
];

/// Fallback when a model isn't in the table (priced like a mid-tier model).
const DEFAULT_PER_MTOK: (Decimal, Decimal) = (dec!(3), dec!(15));

/// USD cost per single (input, output) token for a model name.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let (input, output) = PRICING_PER_MTOK
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PER_MTOK);
    let million = dec!(1_000_000);
    (input / million, output / million)
}
