//! Cost ledger: append-only record of every billed model call.
//!
//! One ledger per run, shared as `Arc<CostLedger>` between concurrent
//! per-email tasks. Appends and the running total update under one lock, so
//! no record is lost or counted twice.

use std::sync::Mutex;

use rust_decimal::Decimal;

use crate::pipeline::types::Stage;

/// One billed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CostRecord {
    pub stage: Stage,
    /// Input tokens (or estimated tokens when `estimated`).
    pub input_units: u64,
    pub output_units: u64,
    /// Cost of this call alone.
    pub cost_usd: Decimal,
    /// Ledger total including this call.
    pub accumulated_usd: Decimal,
    /// Units derived from character counts instead of provider usage.
    pub estimated: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: Vec<CostRecord>,
    total: Decimal,
}

/// Thread-safe cost accumulator.
#[derive(Debug, Default)]
pub struct CostLedger {
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record priced at `(input, output)` USD per unit.
    pub fn record(
        &self,
        stage: Stage,
        input_units: u64,
        output_units: u64,
        unit_price: (Decimal, Decimal),
        estimated: bool,
    ) -> CostRecord {
        let cost_usd =
            Decimal::from(input_units) * unit_price.0 + Decimal::from(output_units) * unit_price.1;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total += cost_usd;
        let record = CostRecord {
            stage,
            input_units,
            output_units,
            cost_usd,
            accumulated_usd: state.total,
            estimated,
        };
        state.records.push(record.clone());
        record
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<CostRecord> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .clone()
    }

    pub fn total(&self) -> Decimal {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).total
    }

    pub fn call_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    /// Number of calls and summed cost for one stage.
    pub fn stage_totals(&self, stage: Stage) -> (usize, Decimal) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .iter()
            .filter(|r| r.stage == stage)
            .fold((0, Decimal::ZERO), |(n, sum), r| (n + 1, sum + r.cost_usd))
    }
}

/// Rough token estimate (~4 chars per token), for calls without reported usage.
pub fn approx_tokens(chars: usize) -> u64 {
    chars.div_ceil(4) as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use super::*;

    const PRICE: (Decimal, Decimal) = (dec!(0.001), dec!(0.002));

    #[test]
    fn record_prices_and_accumulates() {
        let ledger = CostLedger::new();
        let first = ledger.record(Stage::Classify, 100, 10, PRICE, false);
        assert_eq!(first.cost_usd, dec!(0.12));
        assert_eq!(first.accumulated_usd, dec!(0.12));

        let second = ledger.record(Stage::Summarize, 1000, 500, PRICE, false);
        assert_eq!(second.cost_usd, dec!(2.0));
        assert_eq!(second.accumulated_usd, dec!(2.12));
        assert_eq!(ledger.total(), dec!(2.12));
        assert_eq!(ledger.call_count(), 2);
    }

    #[test]
    fn stage_totals_filter_by_stage() {
        let ledger = CostLedger::new();
        ledger.record(Stage::Classify, 10, 0, PRICE, false);
        ledger.record(Stage::Classify, 10, 0, PRICE, true);
        ledger.record(Stage::LinkQa, 10, 0, PRICE, false);
        assert_eq!(ledger.stage_totals(Stage::Classify), (2, dec!(0.02)));
        assert_eq!(ledger.stage_totals(Stage::Synthesize), (0, Decimal::ZERO));
    }

    #[test]
    fn approx_tokens_rounds_up() {
        assert_eq!(approx_tokens(0), 0);
        assert_eq!(approx_tokens(1), 1);
        assert_eq!(approx_tokens(8), 2);
        assert_eq!(approx_tokens(9), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_not_lost() {
        let ledger = Arc::new(CostLedger::new());
        let mut handles = Vec::new();
        for i in 0..64u64 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.record(Stage::Classify, i, 1, PRICE, false).cost_usd
            }));
        }

        let mut expected = Decimal::ZERO;
        for handle in handles {
            expected += handle.await.unwrap();
        }

        assert_eq!(ledger.call_count(), 64);
        assert_eq!(ledger.total(), expected);

        // Running totals are strictly increasing in append order.
        let records = ledger.records();
        for pair in records.windows(2) {
            assert!(pair[1].accumulated_usd > pair[0].accumulated_usd);
        }
        assert_eq!(records.last().unwrap().accumulated_usd, expected);
    }
}
