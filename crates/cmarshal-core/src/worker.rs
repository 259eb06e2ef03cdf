//! Background workers for bound functions
//!
//! A [`WorkerFunction`] owns one dedicated OS thread. Calls are queued on an
//! unbounded channel and executed strictly in submission order, one at a
//! time; each result goes back to its caller through a oneshot channel.
//!
//! A submitted call cannot be cancelled. Dropping the future returned by
//! [`WorkerFunction::call`] only discards the result; the native call still
//! runs to completion.

use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::binder::BoundFunction;
use crate::error::{Error, Result};
use crate::signature::FunctionSignature;
use crate::value::Value;

/// Result of a call executed on a worker: the return value plus the
/// arguments as they stand after the call (by-reference records re-read).
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub value: Value,
    pub args: Vec<Value>,
}

struct Job {
    args: Vec<Value>,
    reply: oneshot::Sender<Result<CallOutcome>>,
}

/// Handle to a bound function running on its own worker thread. Clones
/// share the worker and its queue.
#[derive(Clone)]
pub struct WorkerFunction {
    name: String,
    signature: FunctionSignature,
    sender: mpsc::UnboundedSender<Job>,
}

impl WorkerFunction {
    pub(crate) fn spawn(function: BoundFunction) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let name = function.name().to_string();
        let signature = function.signature().clone();

        thread::Builder::new()
            .name(format!("cmarshal-{}", name))
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    let Job { mut args, reply } = job;
                    trace!(function = function.name(), "worker executing call");
                    // SAFETY: the submitter accepted the contract of
                    // `BoundFunction::call` in `WorkerFunction::call`.
                    let result = unsafe { function.call(&mut args) }
                        .map(|value| CallOutcome { value, args });
                    // The caller may have stopped waiting.
                    let _ = reply.send(result);
                }
                debug!(function = function.name(), "worker stopped");
            })?;

        debug!(function = %name, "started worker");
        Ok(Self {
            name,
            signature,
            sender,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Queue a call and wait for its result.
    ///
    /// Arity is checked here, before anything is queued; argument
    /// conversion happens on the worker, still before the native call.
    ///
    /// # Safety
    ///
    /// Same contract as [`BoundFunction::call`].
    pub async unsafe fn call(&self, args: Vec<Value>) -> Result<CallOutcome> {
        if args.len() != self.signature.arity() {
            return Err(Error::ArityMismatch {
                function: self.name.clone(),
                expected: self.signature.arity(),
                actual: args.len(),
            });
        }

        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { args, reply })
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())?
    }

    fn stopped(&self) -> Error {
        Error::Worker {
            function: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for WorkerFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFunction")
            .field("name", &self.name)
            .field("signature", &format_args!("{}", self.signature))
            .finish()
    }
}
