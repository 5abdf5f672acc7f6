//! Generation worker: model selection under the premium budget, batch execution with one
//! retry pass, response parsing and the final consistency review.

pub mod budget;
pub mod consistency;
pub mod parse;
pub mod prompt;
pub mod worker;

pub use budget::{TokenBudget, EXPECTED_OUTPUT_TOKENS};
pub use worker::{BatchContext, BatchOutcome, FileFailure, GenerationWorker};
