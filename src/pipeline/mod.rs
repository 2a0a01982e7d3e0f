//! Newsletter digest pipeline.
//!
//! Every fetched email flows through:
//! 1. `EmailFilter`: pure pattern matching (no LLM)
//! 2. `Classifier`: newsletter or not, fail-closed
//! 3. `Summarizer`: linked insight bullets per newsletter
//! 4. `Synthesizer`: themed sections across newsletters
//! 5. `LinkQaAgent`: attribution check and repair
//! 6. `assembler::render`: HTML
//!
//! All model calls go through `ModelCaller` and land in the run's `CostLedger`.

pub mod assembler;
pub mod caller;
pub mod classifier;
pub mod filter;
pub mod ledger;
pub mod link_qa;
pub mod runner;
pub mod summarizer;
pub mod synthesizer;
pub mod types;

pub use runner::{DigestPipeline, RunOutcome, RunReport};
