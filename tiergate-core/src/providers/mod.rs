//! Provider conversion, retry and routing
//!
//! This module holds everything between an accepted request and an upstream
//! call: wire-format conversion, the retry executor, and the router that
//! walks the candidate list.

pub mod anthropic;
pub mod convert;
pub mod error;
pub mod openai;
pub mod retry;
pub mod routing;
pub mod sse;
pub mod tokens;

pub use convert::{
    abort_stream, finish_stream, from_provider_response, to_provider_request, translate_chunk,
    ConvertOptions, ConverterState, ProviderRequestBody, ResponseContext,
};
pub use error::{CandidateFailure, GatewayError, GatewayResult};
pub use retry::{AttemptOptions, RetryExecutor, RetryOutcome, RetryPolicy};
pub use routing::{Candidate, CandidatePlan, ProviderRouter, RoutedResponse, RoutedStream};
