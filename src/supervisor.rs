//! Host-facing side of the bridge.
//!
//! The supervisor owns the external byte stream. It reads frames and forwards
//! their payloads to the worker, writes every response the worker produces,
//! and turns any fatal condition into a single `FatalError` frame.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::RhaiEngine;
use crate::error::BridgeError;
use crate::transport::protocol::is_close;
use crate::transport::{read_frame, write_frame, Response};
use crate::worker::{self, WorkerHandle, WorkerOptions};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// `Close` (or end of input) and every admitted request answered.
    Closed,
    /// A fatal error was reported.
    Fatal,
}

impl SessionExit {
    /// Process exit status for this outcome.
    pub const fn code(self) -> i32 {
        match self {
            Self::Closed => 0,
            Self::Fatal => 1,
        }
    }
}

/// Relays frames between the external stream and a worker.
pub struct Supervisor<R, W> {
    reader: R,
    writer: W,
    worker: WorkerHandle,
}

impl<R, W> Supervisor<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    pub const fn new(reader: R, writer: W, worker: WorkerHandle) -> Self {
        Self {
            reader,
            writer,
            worker,
        }
    }

    /// Serve until the session ends.
    pub async fn run(self) -> SessionExit {
        let Self {
            reader,
            mut writer,
            worker,
        } = self;

        match pump(reader, &mut writer, worker).await {
            Ok(()) => {
                info!("Session ended");
                SessionExit::Closed
            }
            Err(err) => {
                error!(error = %err, "Fatal error");
                let frame = Response::FatalError {
                    error: err.to_string().into_bytes(),
                }
                .encode();
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "Failed to report fatal error");
                }
                SessionExit::Fatal
            }
        }
    }
}

async fn pump<R, W>(reader: R, writer: &mut W, worker: WorkerHandle) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let WorkerHandle {
        inbound,
        mut outbound,
        exit,
    } = worker;

    let mut input = tokio::spawn(forward_input(reader, inbound));
    let mut input_done = false;

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => write_frame(writer, &payload).await?,
                // Worker has stopped and every response is written.
                None => break,
            },
            joined = &mut input, if !input_done => {
                input_done = true;
                joined.map_err(|e| BridgeError::WorkerCrashed(format!("input task failed: {e}")))??;
            }
        }
    }
    input.abort();

    exit.await
        .map_err(|_| BridgeError::WorkerCrashed("worker exited without reporting".into()))?
}

/// Forward frames until `Close` or end of input.
///
/// Nothing after `Close` is read. Dropping `inbound` on return tells the
/// worker that no more messages follow.
async fn forward_input<R>(mut reader: R, inbound: mpsc::UnboundedSender<Vec<u8>>) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    while let Some(payload) = read_frame(&mut reader).await? {
        let close = is_close(&payload);
        if inbound.send(payload).is_err() {
            debug!("Worker stopped accepting messages");
            return Ok(());
        }
        if close {
            debug!("Close forwarded, input stopped");
            return Ok(());
        }
    }
    debug!("End of input");
    Ok(())
}

/// Serve one session on stdin/stdout with the rhai engine.
pub async fn serve_stdio(config: Config) -> anyhow::Result<SessionExit> {
    let limits = config.limits.clone();
    let root = config.root.clone();
    let worker = worker::spawn(WorkerOptions::from(&config), move || {
        RhaiEngine::new(&limits, &root)
    })?;

    info!(root = %config.root.display(), "Serving on stdio");
    Ok(Supervisor::new(tokio::io::stdin(), tokio::io::stdout(), worker)
        .run()
        .await)
}
