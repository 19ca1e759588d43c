//! Embedded rhai engine.
//!
//! Assembled expressions are compiled as a single script function whose
//! parameters are the runtime capability followed by the injected values.
//! Asynchronous work is modelled as [`Pending`] values built through the
//! capability and settled on the worker's tokio runtime.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use rhai::module_resolvers::FileModuleResolver;
use rhai::packages::{Package, StandardPackage};
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Scope, AST, INT};
use tracing::{debug, info};

use super::ScriptEngine;
use crate::assembly::Assembled;
use crate::config::EngineLimits;
use crate::error::EvalError;

/// Name of the script function wrapping each assembled expression.
const ENTRY: &str = "__evalbridge_entry";

/// Runtime capability passed as the first argument of every expression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runtime;

/// A computation that has not settled yet.
#[derive(Debug, Clone)]
pub enum Pending {
    Resolved(Dynamic),
    Rejected(String),
    Delay { ms: u64, value: Dynamic },
    ReadFile(PathBuf),
    Then { source: Box<Pending>, callback: FnPtr },
}

/// Result of running an expression, with the script it came from.
///
/// Callbacks attached with `then` live in the script, so it is kept until the
/// result settles.
pub struct RhaiEvaluation {
    value: Dynamic,
    ast: AST,
}

type Settling<'a> = Pin<Box<dyn Future<Output = Result<Dynamic, EvalError>> + 'a>>;

/// rhai-backed [`ScriptEngine`].
pub struct RhaiEngine {
    engine: Engine,
}

impl RhaiEngine {
    /// Build a sandboxed engine resolving imports and file reads from `root`.
    pub fn new(limits: &EngineLimits, root: &Path) -> Self {
        let mut engine = Engine::new_raw();
        engine.register_global_module(StandardPackage::new().as_shared_module());

        engine.set_strict_variables(true);
        engine.set_fail_on_invalid_map_property(true);

        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);

        engine.set_module_resolver(FileModuleResolver::new_with_path(root));

        // stdout carries frames
        engine.on_print(|text| info!(target: "evalbridge::script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "evalbridge::script", source = source.unwrap_or(""), %pos, "{text}");
        });

        register_runtime(&mut engine, root.to_path_buf());

        Self { engine }
    }

    async fn settle(&self, mut value: Dynamic, ast: &AST) -> Result<Dynamic, EvalError> {
        while value.is::<Pending>() {
            let pending = value
                .flatten()
                .try_cast::<Pending>()
                .ok_or_else(|| EvalError::Execution("pending value changed type".into()))?;
            value = self.run(pending, ast).await?;
        }
        Ok(value)
    }

    fn run<'a>(&'a self, pending: Pending, ast: &'a AST) -> Settling<'a> {
        Box::pin(async move {
            match pending {
                Pending::Resolved(value) => Ok(value),
                Pending::Rejected(reason) => Err(EvalError::Execution(format!("Rejected: {reason}"))),
                Pending::Delay { ms, value } => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(value)
                }
                Pending::ReadFile(path) => tokio::fs::read(&path)
                    .await
                    .map(Dynamic::from_blob)
                    .map_err(|e| EvalError::Execution(format!("read_file {}: {e}", path.display()))),
                Pending::Then { source, callback } => {
                    let value = self.run(*source, ast).await?;
                    let value = self.settle(value, ast).await?;
                    callback
                        .call::<Dynamic>(&self.engine, ast, (value,))
                        .map_err(|e| EvalError::Execution(describe(&e)))
                }
            }
        })
    }
}

fn millis(ms: INT) -> Result<u64, Box<EvalAltResult>> {
    u64::try_from(ms).map_err(|_| format!("delay must not be negative: {ms}").into())
}

fn register_runtime(engine: &mut Engine, root: PathBuf) {
    engine
        .register_type_with_name::<Runtime>("Runtime")
        .register_type_with_name::<Pending>("Pending")
        .register_fn("sleep", |_: &mut Runtime, ms: INT| -> Result<Pending, Box<EvalAltResult>> {
            Ok(Pending::Delay {
                ms: millis(ms)?,
                value: Dynamic::UNIT,
            })
        })
        .register_fn(
            "delay",
            |_: &mut Runtime, ms: INT, value: Dynamic| -> Result<Pending, Box<EvalAltResult>> {
                Ok(Pending::Delay {
                    ms: millis(ms)?,
                    value,
                })
            },
        )
        .register_fn("read_file", move |_: &mut Runtime, path: ImmutableString| {
            Pending::ReadFile(root.join(path.as_str()))
        })
        .register_fn("resolve", |_: &mut Runtime, value: Dynamic| Pending::Resolved(value))
        .register_fn("reject", |_: &mut Runtime, reason: ImmutableString| {
            Pending::Rejected(reason.to_string())
        })
        .register_fn("env", |_: &mut Runtime, name: ImmutableString| {
            std::env::var(name.as_str()).map_or(Dynamic::UNIT, Dynamic::from)
        })
        .register_fn("then", |pending: &mut Pending, callback: FnPtr| Pending::Then {
            source: Box::new(pending.clone()),
            callback,
        });
}

/// Error text plus the call chain leading to it.
fn describe(err: &EvalAltResult) -> String {
    let mut text = err.to_string();
    let mut current = err;
    loop {
        if let EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) = current {
            text.push_str(&format!("\n    at {name} ({pos})"));
            current = inner.as_ref();
        } else {
            if !current.position().is_none() {
                text.push_str(&format!("\n    at <expression> ({})", current.position()));
            }
            break;
        }
    }
    text
}

fn unmarshalable(what: &str) -> EvalError {
    EvalError::UnmarshalableResult(format!("cannot convert {what}"))
}

#[async_trait(?Send)]
impl ScriptEngine for RhaiEngine {
    type Value = Dynamic;
    type Evaluation = RhaiEvaluation;

    fn binary(&self, bytes: Vec<u8>) -> Dynamic {
        Dynamic::from_blob(bytes)
    }

    fn text(&self, text: String) -> Dynamic {
        Dynamic::from(text)
    }

    fn json(&self, value: serde_json::Value) -> Result<Dynamic, EvalError> {
        rhai::serde::to_dynamic(value)
            .map_err(|e| EvalError::MalformedExpression(format!("unsupported JSON literal: {e}")))
    }

    fn share(&self, value: Dynamic) -> Dynamic {
        value.into_shared()
    }

    fn start(&self, expr: Assembled<Dynamic>) -> Result<RhaiEvaluation, EvalError> {
        let script = format!("fn {ENTRY}({}) {{\n{}\n}}", expr.formals().join(", "), expr.body);
        let ast = self
            .engine
            .compile(&script)
            .map_err(|e| EvalError::Execution(format!("SyntaxError: {e}")))?;

        let mut args = Vec::with_capacity(expr.args.len() + 1);
        args.push(Dynamic::from(Runtime));
        args.extend(expr.args);

        let value = self
            .engine
            .call_fn::<Dynamic>(&mut Scope::new(), &ast, ENTRY, args)
            .map_err(|e| EvalError::Execution(describe(&e)))?;

        Ok(RhaiEvaluation { value, ast })
    }

    async fn finish(
        &self,
        evaluation: RhaiEvaluation,
        asynchronous: bool,
    ) -> Result<Dynamic, EvalError> {
        let RhaiEvaluation { value, ast } = evaluation;
        if asynchronous {
            self.settle(value, &ast).await
        } else {
            Ok(value)
        }
    }

    fn to_bytes(&self, value: Dynamic) -> Result<Vec<u8>, EvalError> {
        let value = value.flatten();
        if value.is_unit() {
            return Ok(Vec::new());
        }
        if value.is::<Blob>() {
            return value.try_cast::<Blob>().ok_or_else(|| unmarshalable("blob"));
        }
        if value.is::<ImmutableString>() {
            return value
                .try_cast::<ImmutableString>()
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| unmarshalable("string"));
        }
        if value.is::<Array>() {
            let items = value.try_cast::<Array>().ok_or_else(|| unmarshalable("array"))?;
            return items
                .iter()
                .map(|item| {
                    item.as_int()
                        .map(|n| n.to_le_bytes()[0])
                        .map_err(|t| unmarshalable(&format!("array element of type {t} to a byte")))
                })
                .collect();
        }
        Err(unmarshalable(&format!("{} to bytes", value.type_name())))
    }

    fn to_json(&self, value: Dynamic) -> Result<serde_json::Value, EvalError> {
        let value = value.flatten();
        if value.is::<Pending>() || value.is::<Runtime>() || value.is::<FnPtr>() {
            return Err(unmarshalable(&format!("{} to JSON", value.type_name())));
        }
        rhai::serde::from_dynamic(&value)
            .map_err(|e| EvalError::UnmarshalableResult(format!("cannot serialize to JSON: {e}")))
    }
}
