//! Metered model calls: timeout + exactly-once cost recording.
//!
//! Every stage goes through `ModelCaller::call`, so a call that was sent is
//! billed exactly once whether it succeeds, errors, or times out.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, LlmProvider};
use crate::pipeline::ledger::{CostLedger, approx_tokens};
use crate::pipeline::types::Stage;

/// Result of one metered call.
#[derive(Debug)]
pub struct CallOutcome {
    pub result: Result<String, LlmError>,
    /// Cost recorded in the ledger for this call.
    pub cost_usd: Decimal,
}

/// Shared handle bundling the provider, the run's ledger, and the timeout.
#[derive(Clone)]
pub struct ModelCaller {
    llm: Arc<dyn LlmProvider>,
    ledger: Arc<CostLedger>,
    timeout: Duration,
}

impl ModelCaller {
    pub fn new(llm: Arc<dyn LlmProvider>, ledger: Arc<CostLedger>, timeout: Duration) -> Self {
        Self {
            llm,
            ledger,
            timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Send `request`, bounded by the configured timeout, and record its cost.
    pub async fn call(&self, stage: Stage, request: CompletionRequest) -> CallOutcome {
        let prompt_chars = request.char_count();
        let price = self.llm.cost_per_token();

        let outcome = tokio::time::timeout(self.timeout, self.llm.complete(request)).await;

        match outcome {
            Ok(Ok(response)) => {
                let reported = response.input_tokens > 0 || response.output_tokens > 0;
                let (input, output) = if reported {
                    (
                        u64::from(response.input_tokens),
                        u64::from(response.output_tokens),
                    )
                } else {
                    (
                        approx_tokens(prompt_chars),
                        approx_tokens(response.content.chars().count()),
                    )
                };
                let record = self.ledger.record(stage, input, output, price, !reported);
                CallOutcome {
                    result: Ok(response.content),
                    cost_usd: record.cost_usd,
                }
            }
            Ok(Err(e)) => {
                warn!(stage = %stage, error = %e, "Model call failed");
                let record = self
                    .ledger
                    .record(stage, approx_tokens(prompt_chars), 0, price, true);
                CallOutcome {
                    result: Err(e),
                    cost_usd: record.cost_usd,
                }
            }
            Err(_) => {
                warn!(stage = %stage, timeout = ?self.timeout, "Model call timed out");
                let record = self
                    .ledger
                    .record(stage, approx_tokens(prompt_chars), 0, price, true);
                CallOutcome {
                    result: Err(LlmError::Timeout {
                        provider: self.llm.model_name().to_string(),
                        timeout: self.timeout,
                    }),
                    cost_usd: record.cost_usd,
                }
            }
        }
    }
}
