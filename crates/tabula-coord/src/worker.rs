//! Worker threads and the pool that owns them.
//!
//! A worker is a plain OS thread with a blocking receive loop. Its only state is a
//! [`WorkerState`], created uninitialized and moved to ready by the first
//! [`WorkerMessage::Init`]. Each request is handled to completion before the next
//! one is received; the worker is [`WorkerPhase::Encoding`] for the synchronous span
//! of an encode or workload handler.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use tabula_core::{ContextId, Registry, ResourceHandle, TabulaError, TabulaResult, WorkerContext};
use tabula_gpu::WorkerEncoder;

use crate::protocol::{Completion, InitMessage, Signal, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    Uninitialized = 0,
    Ready = 1,
    Encoding = 2,
}

/// A worker's phase, written by the worker thread and readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn get(&self) -> WorkerPhase {
        match self.0.load(Ordering::Acquire) {
            1 => WorkerPhase::Ready,
            2 => WorkerPhase::Encoding,
            _ => WorkerPhase::Uninitialized,
        }
    }

    fn set(&self, phase: WorkerPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

struct Bound<E> {
    ctx: WorkerContext,
    registry: Arc<Registry>,
    encoder: E,
}

impl<E> Bound<E> {
    // The frame target is rewritten every cycle, so it is looked up per encode.
    fn frame_target(&self, index: usize) -> TabulaResult<Option<ResourceHandle>> {
        self.ctx
            .frame_target
            .map(|id| self.registry.get(id)?.transfer_to(ContextId::worker(index)))
            .transpose()
    }
}

/// Per-worker state threaded through every message handler.
pub struct WorkerState<E> {
    index: usize,
    phase: PhaseCell,
    bound: Option<Bound<E>>,
}

impl<E: WorkerEncoder> WorkerState<E> {
    pub fn new(index: usize) -> Self {
        Self::with_phase(index, PhaseCell::default())
    }

    /// A state that reports its phase through `phase`.
    pub fn with_phase(index: usize, phase: PhaseCell) -> Self {
        phase.set(WorkerPhase::Uninitialized);
        Self {
            index,
            phase,
            bound: None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase.get()
    }

    pub fn context(&self) -> Option<&WorkerContext> {
        self.bound.as_ref().map(|bound| &bound.ctx)
    }

    /// Handle one message. Returns `None` only for [`WorkerMessage::Shutdown`].
    pub fn handle(&mut self, message: WorkerMessage) -> Option<Completion> {
        let index = self.index;
        let completion = match message {
            WorkerMessage::Init(init) => self.initialize(init),
            WorkerMessage::Encode { cycle } => self.encode(cycle),
            WorkerMessage::Workload {
                trial,
                dispatch_count,
            } => self.workload(trial, dispatch_count),
            WorkerMessage::Unavailable => {
                tracing::debug!("worker {}: payload unavailable, nothing to do", index);
                Completion::ok(index, Signal::Unavailable)
            }
            WorkerMessage::Shutdown => return None,
        };
        Some(completion)
    }

    fn initialize(&mut self, init: InitMessage) -> Completion {
        if self.bound.is_some() {
            return Completion::failed(
                self.index,
                Signal::Init,
                TabulaError::worker(self.index, "already initialized"),
            );
        }
        let ctx = init.context();
        match E::bind(&ctx, &init.registry) {
            Ok(encoder) => {
                tracing::debug!(
                    "worker {} ready: output {}, {} shared resources",
                    self.index,
                    ctx.output_id,
                    ctx.shared.all().len()
                );
                self.bound = Some(Bound {
                    ctx,
                    registry: init.registry,
                    encoder,
                });
                self.phase.set(WorkerPhase::Ready);
                Completion::ok(self.index, Signal::Init)
            }
            Err(e) => Completion::failed(self.index, Signal::Init, e),
        }
    }

    fn encode(&mut self, cycle: u64) -> Completion {
        let index = self.index;
        let Some(bound) = self.bound.as_mut() else {
            return Completion::failed(
                index,
                Signal::Frame(cycle),
                TabulaError::worker(index, "encode requested before init"),
            );
        };

        self.phase.set(WorkerPhase::Encoding);
        let start = Instant::now();
        let outcome = bound.frame_target(index).and_then(|target| {
            let artifact = bound.encoder.encode_frame(cycle, target.as_ref())?;
            bound
                .registry
                .insert_as(ContextId::worker(index), bound.ctx.output_id, artifact)
        });
        let elapsed = start.elapsed();
        self.phase.set(WorkerPhase::Ready);
        if let Err(e) = &outcome {
            tracing::debug!("worker {}: cycle {} failed: {}", index, cycle, e);
        }

        Completion {
            worker: index,
            signal: Signal::Frame(cycle),
            elapsed: Some(elapsed),
            outcome: outcome.map(Some),
        }
    }

    fn workload(&mut self, trial: u64, dispatch_count: u32) -> Completion {
        let index = self.index;
        let Some(bound) = self.bound.as_mut() else {
            return Completion::failed(
                index,
                Signal::Trial(trial),
                TabulaError::worker(index, "workload requested before init"),
            );
        };

        self.phase.set(WorkerPhase::Encoding);
        let start = Instant::now();
        let outcome = bound.encoder.encode_workload(dispatch_count);
        let elapsed = start.elapsed();
        self.phase.set(WorkerPhase::Ready);
        Completion {
            worker: index,
            signal: Signal::Trial(trial),
            elapsed: Some(elapsed),
            outcome: outcome.map(|()| None),
        }
    }
}

fn run_worker<E: WorkerEncoder>(
    index: usize,
    phase: PhaseCell,
    mut inbox: UnboundedReceiver<WorkerMessage>,
    completions: UnboundedSender<Completion>,
) {
    let mut state = WorkerState::<E>::with_phase(index, phase);
    while let Some(message) = inbox.blocking_recv() {
        tracing::trace!("worker {} received {}", index, message.name());
        let Some(completion) = state.handle(message) else {
            break;
        };
        if completions.send(completion).is_err() {
            break;
        }
    }
    tracing::debug!("worker {} exiting", index);
}

/// A fixed set of worker threads and the channels to reach them.
///
/// Dropping the pool sends [`WorkerMessage::Shutdown`] to every worker and joins
/// the threads.
pub struct WorkerPool<E> {
    senders: Vec<UnboundedSender<WorkerMessage>>,
    completions: UnboundedReceiver<Completion>,
    phases: Vec<PhaseCell>,
    threads: Vec<JoinHandle<()>>,
    _encoder: PhantomData<fn() -> E>,
}

impl<E: WorkerEncoder> WorkerPool<E> {
    pub fn spawn(count: usize) -> TabulaResult<Self> {
        if count == 0 {
            return Err(TabulaError::InvalidArgument(
                "worker pool needs at least one worker".into(),
            ));
        }

        let (completion_tx, completions) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(count);
        let mut phases = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let completion_tx = completion_tx.clone();
            let phase = PhaseCell::default();
            let worker_phase = phase.clone();
            let thread = std::thread::Builder::new()
                .name(format!("tabula-worker-{}", index))
                .spawn(move || run_worker::<E>(index, worker_phase, rx, completion_tx))?;
            senders.push(tx);
            phases.push(phase);
            threads.push(thread);
        }

        tracing::debug!("spawned {} workers", count);
        Ok(Self {
            senders,
            completions,
            phases,
            threads,
            _encoder: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// The current phase of `worker`, if it exists.
    pub fn phase(&self, worker: usize) -> Option<WorkerPhase> {
        self.phases.get(worker).map(PhaseCell::get)
    }

    pub fn send(&self, worker: usize, message: WorkerMessage) -> TabulaResult<()> {
        let sender = self.senders.get(worker).ok_or_else(|| {
            TabulaError::InvalidArgument(format!(
                "no worker {} in a pool of {}",
                worker,
                self.senders.len()
            ))
        })?;
        sender.send(message).map_err(|_| TabulaError::ChannelClosed)
    }

    /// Send `make(index)` to every worker in index order.
    pub fn broadcast<F>(&self, mut make: F) -> TabulaResult<()>
    where
        F: FnMut(usize) -> WorkerMessage,
    {
        for index in 0..self.senders.len() {
            self.send(index, make(index))?;
        }
        Ok(())
    }

    /// The next completion from any worker.
    pub async fn recv(&mut self) -> TabulaResult<Completion> {
        self.completions.recv().await.ok_or(TabulaError::ChannelClosed)
    }

    /// Send one init message per worker and wait for every acknowledgement.
    ///
    /// Workers whose shared handles cannot be transferred receive the unavailable
    /// sentinel instead and stay uninitialized. Returns the first setup error once
    /// all workers have answered.
    pub async fn initialize(&mut self, inits: Vec<InitMessage>) -> TabulaResult<()> {
        if inits.len() != self.len() {
            return Err(TabulaError::InvalidArgument(format!(
                "{} init messages for {} workers",
                inits.len(),
                self.len()
            )));
        }

        let mut first_error = None;
        for init in inits {
            let index = init.index;
            let message = match init.pack() {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("worker {}: init not transferable ({}), sending sentinel", index, e);
                    first_error.get_or_insert(e);
                    WorkerMessage::Unavailable
                }
            };
            self.send(index, message)?;
        }

        let mut acknowledged = 0;
        while acknowledged < self.len() {
            let completion = self.recv().await?;
            match completion.signal {
                Signal::Init | Signal::Unavailable => {
                    acknowledged += 1;
                    if let Err(e) = completion.outcome {
                        tracing::warn!("worker {} failed to initialize: {}", completion.worker, e);
                        first_error.get_or_insert(e);
                    }
                }
                other => tracing::debug!("ignoring {:?} while initializing", other),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
