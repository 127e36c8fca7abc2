//! Parallel script verification for one block at a time.
//!
//! Connecting a block queues one [`ScriptCheck`] per input. The checks are cut
//! into chunks and fed to a fixed set of worker threads over a channel; the
//! caller then waits for every chunk (one join barrier per block). Once a check
//! fails, workers skip every check positioned after it, so the failure
//! reported is always the lowest (tx, input) that fails.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::script::{verify_script, ScriptError, ScriptFlags};
use crate::core::types::Block;

/// Below this many checks the block is verified on the calling thread.
const MIN_PARALLEL_CHECKS: usize = 16;
const MIN_CHUNK: usize = 8;

/// Verify input `input_index` of transaction `tx_index` against the coin it spends.
#[derive(Debug, Clone)]
pub struct ScriptCheck {
    pub tx_index: usize,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub spent_value: u64,
}

impl ScriptCheck {
    fn position(&self) -> u64 {
        ((self.tx_index as u64) << 32) | self.input_index as u64
    }

    fn run(&self, block: &Block, flags: ScriptFlags) -> Result<(), ScriptError> {
        let tx = block.transactions.get(self.tx_index).ok_or(ScriptError::InputIndex)?;
        let input = tx.inputs.get(self.input_index).ok_or(ScriptError::InputIndex)?;
        verify_script(
            &input.script_sig,
            &self.script_pubkey,
            tx,
            self.input_index,
            flags,
            self.spent_value,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub tx_index: usize,
    pub input_index: usize,
    pub error: ScriptError,
}

/// Chunk number and its outcome.
type ChunkReply = (usize, Option<CheckFailure>);

struct Job {
    chunk: usize,
    block: Arc<Block>,
    checks: Vec<ScriptCheck>,
    flags: ScriptFlags,
    /// Lowest failing position seen so far, `u64::MAX` while none
    first_failure: Arc<AtomicU64>,
    reply: Sender<ChunkReply>,
}

/// Run checks in order, skipping those behind a known earlier failure.
fn run_checks(
    block: &Block,
    checks: &[ScriptCheck],
    flags: ScriptFlags,
    first_failure: &AtomicU64,
) -> Option<CheckFailure> {
    for check in checks {
        if check.position() > first_failure.load(Ordering::Acquire) {
            return None;
        }
        if let Err(error) = check.run(block, flags) {
            first_failure.fetch_min(check.position(), Ordering::AcqRel);
            return Some(CheckFailure {
                tx_index: check.tx_index,
                input_index: check.input_index,
                error,
            });
        }
    }
    None
}

pub struct CheckQueue {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl CheckQueue {
    /// Start `threads` workers. Zero verifies everything on the caller's thread.
    pub fn new(threads: usize) -> Self {
        if threads == 0 {
            return Self {
                sender: Mutex::new(None),
                workers: Vec::new(),
            };
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads)
            .filter_map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("scriptcheck-{i}"))
                    .spawn(move || worker_loop(rx))
                    .map_err(|e| warn!("⚠️  Could not start script worker {}: {}", i, e))
                    .ok()
            })
            .collect::<Vec<_>>();
        debug!("🧵 Script check queue started with {} workers", workers.len());

        let sender = if workers.is_empty() { None } else { Some(tx) };
        Self {
            sender: Mutex::new(sender),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Verify every check against `block`. Returns the lowest failing check.
    pub fn verify(&self, block: &Arc<Block>, checks: Vec<ScriptCheck>, flags: ScriptFlags) -> Result<(), CheckFailure> {
        let first_failure = Arc::new(AtomicU64::new(u64::MAX));
        let sender = self.sender.lock().clone();
        let sender = match sender {
            Some(s) if checks.len() >= MIN_PARALLEL_CHECKS => s,
            _ => {
                return match run_checks(block, &checks, flags, &first_failure) {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                }
            }
        };

        let chunk_size = (checks.len() / (self.workers.len() * 4)).max(MIN_CHUNK);
        let (reply_tx, reply_rx) = mpsc::channel();
        // First check of each chunk handed to a worker, by chunk number
        let mut dispatched = Vec::new();
        let mut failures = Vec::new();

        let mut remaining = checks;
        while !remaining.is_empty() {
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let first = (remaining[0].tx_index, remaining[0].input_index);
            let job = Job {
                chunk: dispatched.len(),
                block: block.clone(),
                checks: remaining,
                flags,
                first_failure: first_failure.clone(),
                reply: reply_tx.clone(),
            };
            if let Err(mpsc::SendError(job)) = sender.send(job) {
                // Workers gone; finish this chunk here
                failures.extend(run_checks(&job.block, &job.checks, flags, &first_failure));
            } else {
                dispatched.push(first);
            }
            remaining = rest;
        }
        drop(reply_tx);

        failures.extend(collect_replies(&reply_rx, &dispatched));
        match failures.into_iter().min_by_key(|f| (f.tx_index, f.input_index)) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Wait for every dispatched chunk. A chunk whose worker went away without
/// replying counts as a `WorkerLost` failure at its first check.
fn collect_replies(reply_rx: &Receiver<ChunkReply>, dispatched: &[(usize, usize)]) -> Vec<CheckFailure> {
    let mut reported = vec![false; dispatched.len()];
    let mut failures = Vec::new();
    for _ in 0..dispatched.len() {
        match reply_rx.recv() {
            Ok((chunk, result)) => {
                if let Some(slot) = reported.get_mut(chunk) {
                    *slot = true;
                }
                failures.extend(result);
            }
            // Every sender is gone: no more replies can arrive
            Err(_) => break,
        }
    }

    for (chunk, &(tx_index, input_index)) in dispatched.iter().enumerate() {
        if !reported[chunk] {
            warn!("⚠️  Script check chunk {} was never reported", chunk);
            failures.push(CheckFailure {
                tx_index,
                input_index,
                error: ScriptError::WorkerLost,
            });
        }
    }
    failures
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock();
            guard.recv()
        };
        let Ok(job) = job else {
            return;
        };
        let result = run_checks(&job.block, &job.checks, job.flags, &job.first_failure);
        let _ = job.reply.send((job.chunk, result));
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
