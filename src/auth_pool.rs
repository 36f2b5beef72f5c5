//! Bounded worker pool for token verification.
//!
//! Cryptographic verification is CPU-bound, so it runs on a fixed number of
//! blocking workers instead of the request-handling tasks. Workers announce
//! readiness by publishing their private job channel into a shared bounded
//! registration queue; a caller takes a ready worker off the queue, hands it
//! exactly one job, and waits on a single-use reply channel. When every
//! worker is busy, callers queue up on the registration channel — there is
//! no pool-exhausted error, backpressure is implicit in waiting.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::auth::{AuthError, Claims, TokenVerifier};

/// Worker count used when the configured value is zero.
const DEFAULT_WORKERS: usize = 4;

/// One verification job, destroyed after its reply is consumed.
struct AuthJob {
    credential: String,
    reply: oneshot::Sender<Result<Claims, AuthError>>,
}

/// What a worker runs for each job.
type VerifyFn = Arc<dyn Fn(&str) -> Result<Claims, AuthError> + Send + Sync>;

/// Fixed-size pool of verification workers.
///
/// Safe under arbitrary concurrent callers: the registration queue is the
/// single point of serialization for worker assignment, and each job's
/// reply channel is private to its caller.
pub struct AuthPool {
    ready_rx: Mutex<mpsc::Receiver<mpsc::Sender<AuthJob>>>,
    workers: usize,
}

impl AuthPool {
    /// Launches `workers` verification workers sharing `verifier`.
    ///
    /// Workers run for the life of the pool and exit when it is dropped;
    /// they hold no per-request state between jobs.
    pub fn new(workers: usize, verifier: TokenVerifier) -> Self {
        let verifier = Arc::new(verifier);
        Self::with_verify_fn(workers, move |credential| verifier.verify(credential))
    }

    fn with_verify_fn<F>(workers: usize, verify: F) -> Self
    where
        F: Fn(&str) -> Result<Claims, AuthError> + Send + Sync + 'static,
    {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let (ready_tx, ready_rx) = mpsc::channel(workers);
        let verify: VerifyFn = Arc::new(verify);

        for id in 0..workers {
            let ready_tx = ready_tx.clone();
            let verify = Arc::clone(&verify);
            tokio::task::spawn_blocking(move || worker_loop(id, verify, ready_tx));
        }

        Self {
            ready_rx: Mutex::new(ready_rx),
            workers,
        }
    }

    /// Number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Verifies a credential on a pool worker, waiting for a free one.
    ///
    /// At most `workers` verifications are in flight at any instant; the
    /// surrounding server's timeouts bound how long a caller may wait.
    pub async fn authenticate(&self, credential: String) -> Result<Claims, AuthError> {
        let job_tx = {
            let mut ready = self.ready_rx.lock().await;
            ready.recv().await.ok_or(AuthError::PoolUnavailable)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        job_tx
            .send(AuthJob {
                credential,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AuthError::PoolUnavailable)?;

        reply_rx.await.map_err(|_| AuthError::PoolUnavailable)?
    }
}

/// Worker run loop: register, take one job, verify, reply, re-register.
///
/// A fresh job channel is created per registration cycle so that a caller
/// abandoning its claimed worker (e.g. a timed-out request task) only
/// costs this worker one cycle, not its life.
fn worker_loop(id: usize, verify: VerifyFn, ready_tx: mpsc::Sender<mpsc::Sender<AuthJob>>) {
    loop {
        let (job_tx, mut job_rx) = mpsc::channel::<AuthJob>(1);
        if ready_tx.blocking_send(job_tx).is_err() {
            break;
        }

        match job_rx.blocking_recv() {
            Some(job) => {
                let result = verify(&job.credential);
                // The caller may have given up waiting; nothing to do then.
                let _ = job.reply.send(result);
            }
            None => {
                if ready_tx.is_closed() {
                    break;
                }
            }
        }
    }
    debug!(worker = id, "auth worker stopped");
}
