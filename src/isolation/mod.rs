//! Isolated execution contexts.
//!
//! A context is a dedicated worker thread that shares nothing with its
//! creator apart from the library search path it was set up with. The
//! guarded image and its token cross into the worker as bincode bytes, and
//! the reply comes back the same way, so no value built inside the boundary
//! is ever observed outside it.
//!
//! A context serves exactly one invocation and is torn down afterwards,
//! explicitly through [`IsolationContext::teardown`] or by dropping it.

mod remote;

pub use remote::{execute, RemoteReply, RemoteRequest};

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::guard::GuardToken;
use crate::runtime::{HostApi, STANDARD_LIBRARIES};

/// Default worker stack size (8 MiB)
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Isolation errors
#[derive(Debug, Error)]
pub enum IsolationError {
    /// Worker thread could not be started
    #[error("failed to spawn isolation worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// Request could not be encoded
    #[error("failed to encode isolation request: {0}")]
    Encode(String),
    /// Reply could not be decoded
    #[error("failed to decode isolation reply: {0}")]
    Decode(String),
    /// Worker exited without replying
    #[error("isolation worker terminated without replying")]
    WorkerLost,
    /// A context serves a single invocation
    #[error("isolation context has already been invoked")]
    AlreadyInvoked,
}

/// How a new context is configured
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSetup {
    /// Host libraries resolvable inside the context
    pub libraries: Vec<String>,
    /// Worker thread stack size in bytes
    pub stack_size: usize,
    /// Worker thread name prefix
    pub name_prefix: String,
}

impl Default for ContextSetup {
    fn default() -> Self {
        Self {
            libraries: STANDARD_LIBRARIES.iter().map(ToString::to_string).collect(),
            stack_size: DEFAULT_STACK_SIZE,
            name_prefix: "tracebox-isolate".to_string(),
        }
    }
}

struct Envelope {
    request: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// A disposable execution boundary.
///
/// The channel calls block the current thread, so contexts must not be
/// driven from inside an async runtime; use `spawn_blocking` there.
pub struct IsolationContext {
    id: u64,
    requests: Option<mpsc::Sender<Envelope>>,
    worker: Option<JoinHandle<()>>,
    invoked: bool,
}

impl IsolationContext {
    /// Spawn the worker for a new context
    ///
    /// # Errors
    /// Returns error if the worker thread cannot be spawned
    pub fn create(setup: &ContextSetup) -> Result<Self, IsolationError> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (requests, mut inbox) = mpsc::channel::<Envelope>(1);
        let libraries = setup.libraries.clone();

        let worker = thread::Builder::new()
            .name(format!("{}-{id}", setup.name_prefix))
            .stack_size(setup.stack_size)
            .spawn(move || {
                let host = HostApi::from_libraries(&libraries);
                if let Some(envelope) = inbox.blocking_recv() {
                    let reply = remote::dispatch(&host, &envelope.request);
                    if envelope.reply.send(reply).is_err() {
                        warn!("isolation caller went away before the reply");
                    }
                }
            })
            .map_err(IsolationError::Spawn)?;

        debug!(context = id, libraries = setup.libraries.len(), "isolation context created");
        Ok(Self {
            id,
            requests: Some(requests),
            worker: Some(worker),
            invoked: false,
        })
    }

    /// Context identifier, unique within the process
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Run the guarded program inside the boundary.
    ///
    /// The token is consumed; it scopes this single invocation only.
    ///
    /// # Errors
    /// Returns error if the context was already invoked, the worker died, or
    /// the messages could not be encoded
    pub fn invoke(&mut self, program: &[u8], token: GuardToken) -> Result<RemoteReply, IsolationError> {
        if self.invoked {
            return Err(IsolationError::AlreadyInvoked);
        }
        self.invoked = true;

        let request = bincode::serialize(&RemoteRequest {
            program: program.to_vec(),
            token,
        })
        .map_err(|e| IsolationError::Encode(e.to_string()))?;

        let requests = self.requests.as_ref().ok_or(IsolationError::WorkerLost)?;
        let (reply, response) = oneshot::channel();
        requests
            .blocking_send(Envelope { request, reply })
            .map_err(|_| IsolationError::WorkerLost)?;
        let bytes = response
            .blocking_recv()
            .map_err(|_| IsolationError::WorkerLost)?;

        bincode::deserialize(&bytes).map_err(|e| IsolationError::Decode(e.to_string()))
    }

    /// Release the boundary and wait for the worker to exit
    ///
    /// # Errors
    /// Returns [`IsolationError::WorkerLost`] if the worker panicked
    pub fn teardown(mut self) -> Result<(), IsolationError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), IsolationError> {
        // closing the request channel ends an idle worker
        drop(self.requests.take());
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let joined = worker.join();
        debug!(context = self.id, "isolation context torn down");
        joined.map_err(|_| IsolationError::WorkerLost)
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(context = self.id, error = %e, "isolation teardown failed");
        }
    }
}

impl std::fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.id)
            .field("invoked", &self.invoked)
            .field("live", &self.worker.is_some())
            .finish()
    }
}
