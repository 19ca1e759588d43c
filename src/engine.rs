//! Scripting engine trait and implementations.
//!
//! The worker never interprets expression source itself. It builds injected
//! values, hands the assembled expression to the engine, and asks the engine
//! to coerce results for marshaling.

mod rhai_engine;

pub use rhai_engine::{Pending, RhaiEngine, RhaiEvaluation, Runtime};

use async_trait::async_trait;

use crate::assembly::Assembled;
use crate::error::EvalError;

/// Trait for scripting engines hosted by the evaluation worker.
///
/// Engines live on the worker thread only, so neither the engine nor its
/// values need to be `Send`.
#[async_trait(?Send)]
pub trait ScriptEngine {
    /// Engine-side value.
    type Value: Clone + 'static;

    /// Wrap raw bytes as a binary value.
    fn binary(&self, bytes: Vec<u8>) -> Self::Value;

    /// Wrap a decoded string.
    fn text(&self, text: String) -> Self::Value;

    /// Convert parsed JSON into an engine value.
    fn json(&self, value: serde_json::Value) -> Result<Self::Value, EvalError>;

    /// Turn a value into one that is held by reference, for the handle table.
    fn share(&self, value: Self::Value) -> Self::Value;

    /// A started evaluation that may still have to settle.
    type Evaluation: 'static;

    /// Compile the assembled expression and run it up to its result.
    ///
    /// Runs synchronously, at admission time. The result may be a pending
    /// computation.
    fn start(&self, expr: Assembled<Self::Value>) -> Result<Self::Evaluation, EvalError>;

    /// Produce the final value of a started evaluation.
    ///
    /// When `asynchronous` is set, a pending result is awaited until it
    /// settles. This is the only place a request may suspend.
    async fn finish(
        &self,
        evaluation: Self::Evaluation,
        asynchronous: bool,
    ) -> Result<Self::Value, EvalError>;

    /// Coerce a value to raw bytes.
    fn to_bytes(&self, value: Self::Value) -> Result<Vec<u8>, EvalError>;

    /// Coerce a value to JSON.
    fn to_json(&self, value: Self::Value) -> Result<serde_json::Value, EvalError>;
}
