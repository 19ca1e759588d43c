//! Evaluation worker.
//!
//! The worker runs on its own OS thread with a single-threaded tokio runtime.
//! Messages are handled strictly in arrival order: decoding, assembly and the
//! synchronous part of every expression run at admission. Each admitted
//! request then becomes a local task that waits for its result to settle,
//! marshals it and posts the response, so responses can overtake each other
//! and are correlated only by request id.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet, LocalSet};
use tracing::{debug, error, info, warn};

use crate::assembly::assemble;
use crate::config::Config;
use crate::engine::ScriptEngine;
use crate::error::{BridgeError, EvalError};
use crate::handles::HandleTable;
use crate::marshal::marshal;
use crate::transport::protocol::{DecodeError, EvalRequest, Message, Response, ValueKind};

/// Name of the link created in the resolution root for the dependency directory.
pub const MODULES_LINK: &str = "modules";

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepting messages.
    Idle,
    /// `Close` received; waiting for admitted requests.
    Closing,
    /// Table cleared, nothing left to do.
    Closed,
}

/// Settings the worker thread needs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub modules_dir: Option<PathBuf>,
    pub root: PathBuf,
    pub exit_on_eval_error: bool,
}

impl From<&Config> for WorkerOptions {
    fn from(config: &Config) -> Self {
        Self {
            modules_dir: config.modules_dir.clone(),
            root: config.root.clone(),
            exit_on_eval_error: config.exit_on_eval_error,
        }
    }
}

/// Channel ends the supervisor keeps for a running worker.
pub struct WorkerHandle {
    /// Payloads to the worker.
    pub inbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Response payloads from the worker. Closes when the worker stops.
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    /// How the worker ended.
    pub exit: oneshot::Receiver<Result<(), BridgeError>>,
}

/// Posts responses and applies the fail-fast policy.
#[derive(Clone)]
struct Responder {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    exit_on_eval_error: bool,
}

impl Responder {
    fn post(&self, response: &Response) {
        if self.outbound.send(response.encode()).is_err() {
            debug!("Supervisor gone, dropping response");
        }
    }

    fn reply(&self, request_id: u64, outcome: Result<Vec<u8>, EvalError>) -> Result<(), BridgeError> {
        let err = match outcome {
            Ok(result) => {
                debug!(request_id, len = result.len(), "Evaluation succeeded");
                self.post(&Response::EvalSuccess { request_id, result });
                return Ok(());
            }
            Err(err) => err.to_string(),
        };

        warn!(request_id, error = %err, "Evaluation failed");
        self.post(&Response::EvalFailure {
            request_id,
            error: err.clone().into_bytes(),
        });

        if self.exit_on_eval_error {
            error!(request_id, "Exiting on evaluation error");
            return Err(BridgeError::EvalFailed(err));
        }
        Ok(())
    }
}

/// Message-handling state machine for one session.
pub struct Worker<E: ScriptEngine> {
    engine: Rc<E>,
    table: Rc<RefCell<HandleTable<E::Value>>>,
    responder: Responder,
    state: State,
}

impl<E: ScriptEngine + 'static> Worker<E> {
    /// Create a worker that posts encoded responses to `outbound`.
    pub fn new(engine: E, outbound: mpsc::UnboundedSender<Vec<u8>>, exit_on_eval_error: bool) -> Self {
        Self {
            engine: Rc::new(engine),
            table: Rc::new(RefCell::new(HandleTable::new())),
            responder: Responder {
                outbound,
                exit_on_eval_error,
            },
            state: State::Idle,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Number of live handles.
    pub fn live_handles(&self) -> usize {
        self.table.borrow().len()
    }

    /// Serve messages until `Close` (or the inbound channel closes).
    ///
    /// Must run inside a [`LocalSet`]. After `Close` no more messages are
    /// read; requests already admitted finish and post their responses, then
    /// the handle table is cleared.
    pub async fn run(&mut self, inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Result<(), BridgeError> {
        let mut tasks = JoinSet::new();

        while self.state == State::Idle {
            tokio::select! {
                payload = inbound.recv() => match payload {
                    Some(payload) => self.dispatch(&payload, &mut tasks)?,
                    None => {
                        info!("Inbound channel closed without Close");
                        self.state = State::Closing;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined)?,
            }
        }

        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "Waiting for admitted requests");
        }
        while let Some(joined) = tasks.join_next().await {
            reap(joined)?;
        }

        let live = self.live_handles();
        self.table.borrow_mut().clear();
        self.state = State::Closed;
        info!(freed = live, "Session closed");
        Ok(())
    }

    fn dispatch(
        &mut self,
        payload: &[u8],
        tasks: &mut JoinSet<Result<(), BridgeError>>,
    ) -> Result<(), BridgeError> {
        match Message::decode(payload) {
            Ok(Message::Eval(request)) => {
                let request_id = request.request_id;
                debug!(request_id, segments = request.expression.len(), "Eval request");
                let EvalRequest {
                    expression,
                    wants_async,
                    return_kind,
                    ..
                } = request;

                let started = assemble(expression, self.engine.as_ref(), &self.table.borrow())
                    .and_then(|assembled| self.engine.start(assembled));
                match started {
                    Ok(evaluation) => {
                        tasks.spawn_local(self.complete(request_id, evaluation, wants_async, return_kind));
                    }
                    Err(err) => self.responder.reply(request_id, Err(err))?,
                }
            }
            Ok(Message::HandleFree { handle }) => {
                self.table.borrow_mut().free(handle)?;
                debug!(handle, "Freed handle");
            }
            Ok(Message::Close) => {
                debug!("Close received");
                self.state = State::Closing;
            }
            Err(DecodeError::Request { request_id, source }) => {
                self.responder.reply(request_id, Err(source.into()))?;
            }
            Err(DecodeError::Envelope(err)) => return Err(err.into()),
        }
        Ok(())
    }

    fn complete(
        &self,
        request_id: u64,
        evaluation: E::Evaluation,
        wants_async: bool,
        return_kind: ValueKind,
    ) -> impl Future<Output = Result<(), BridgeError>> + 'static {
        let engine = Rc::clone(&self.engine);
        let table = Rc::clone(&self.table);
        let responder = self.responder.clone();

        async move {
            let outcome = match engine.finish(evaluation, wants_async).await {
                Ok(value) => marshal(value, return_kind, engine.as_ref(), &mut table.borrow_mut()),
                Err(err) => Err(err),
            };
            responder.reply(request_id, outcome)
        }
    }
}

fn reap(joined: Result<Result<(), BridgeError>, JoinError>) -> Result<(), BridgeError> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(BridgeError::WorkerCrashed(panic_message(
            err.into_panic().as_ref(),
        ))),
        Err(err) => Err(BridgeError::WorkerCrashed(err.to_string())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Link `target` into `root` as [`MODULES_LINK`], replacing a previous link.
pub async fn link_modules(target: &Path, root: &Path) -> Result<PathBuf, BridgeError> {
    let link = root.join(MODULES_LINK);
    let fail = |source| BridgeError::Startup {
        target: target.to_path_buf(),
        link: link.clone(),
        source,
    };

    if let Ok(meta) = tokio::fs::symlink_metadata(&link).await {
        if meta.file_type().is_symlink() {
            tokio::fs::remove_file(&link).await.map_err(fail)?;
        }
    }
    symlink_dir(target, &link).await.map_err(fail)?;

    info!(target = %target.display(), link = %link.display(), "Linked dependency directory");
    Ok(link)
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

/// Start the worker thread.
///
/// `make_engine` runs on the worker thread, so the engine itself need not be
/// `Send`.
pub fn spawn<E, F>(options: WorkerOptions, make_engine: F) -> io::Result<WorkerHandle>
where
    E: ScriptEngine + 'static,
    F: FnOnce() -> E + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("evalbridge-worker".into())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                serve(options, make_engine, inbound_rx, outbound_tx)
            }))
            .unwrap_or_else(|panic| Err(BridgeError::WorkerCrashed(panic_message(panic.as_ref()))));
            if exit_tx.send(result).is_err() {
                debug!("Supervisor gone before worker exit");
            }
        })?;

    Ok(WorkerHandle {
        inbound: inbound_tx,
        outbound: outbound_rx,
        exit: exit_rx,
    })
}

fn serve<E, F>(
    options: WorkerOptions,
    make_engine: F,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), BridgeError>
where
    E: ScriptEngine + 'static,
    F: FnOnce() -> E,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BridgeError::WorkerCrashed(format!("failed to start worker runtime: {e}")))?;
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        if let Some(dir) = &options.modules_dir {
            link_modules(dir, &options.root).await?;
        }
        let mut worker = Worker::new(make_engine(), outbound, options.exit_on_eval_error);
        worker.run(&mut inbound).await
    })
}
