use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use fragstream_common::{CameraState, ModelId};

use crate::config::ChannelConfig;
use crate::geometry::GeometryHandle;
use crate::worker::{FragmentWorker, WorkerEntry, WorkerEvent, WorkerMsg, run_worker};

/// Errors surfaced by the decode channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("decode channel failed to start: {0}")]
    Init(String),
    #[error("decode channel is closed")]
    Closed,
    #[error("model {0} already has a decode in flight")]
    DuplicateInFlight(ModelId),
    #[error("model {0} is not decoded on this channel")]
    UnknownModel(ModelId),
    #[error("model {0} was disposed before the request completed")]
    Disposed(ModelId),
    #[error("decode worker {0} crashed")]
    WorkerCrashed(usize),
    #[error("failed to decode model {model}: {reason}")]
    Decode { model: ModelId, reason: String },
}

/// Correlation id attached to every request crossing the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A reply that has not necessarily arrived yet.
///
/// Never blocks unless `wait`/`wait_timeout` is called. Once the result has
/// been taken, further polls return `None`.
#[derive(Debug)]
pub struct Pending<T> {
    request: RequestId,
    rx: Receiver<Result<T, ChannelError>>,
    done: bool,
}

impl<T> Pending<T> {
    fn new(request: RequestId, rx: Receiver<Result<T, ChannelError>>) -> Self {
        Self {
            request,
            rx,
            done: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Take the result if it has arrived.
    pub fn try_take(&mut self) -> Option<Result<T, ChannelError>> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.done = true;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                Some(Err(ChannelError::Closed))
            }
        }
    }

    /// Wait up to `timeout`. On expiry the request stays pending.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T, ChannelError>> {
        if self.done {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.done = true;
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Some(Err(ChannelError::Closed))
            }
        }
    }

    pub fn wait(self) -> Result<T, ChannelError> {
        if self.done {
            return Err(ChannelError::Closed);
        }
        self.rx.recv().unwrap_or(Err(ChannelError::Closed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Decode,
    Refresh,
}

struct PendingEntry {
    worker: usize,
    model: ModelId,
    kind: RequestKind,
    reply: Sender<Result<GeometryHandle, ChannelError>>,
}

#[derive(Default)]
struct ChannelState {
    closed: bool,
    next_request: u64,
    pending: HashMap<RequestId, PendingEntry>,
    in_flight_decodes: HashSet<ModelId>,
    dead_workers: HashSet<usize>,
}

impl ChannelState {
    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }
}

struct Inner {
    state: Arc<Mutex<ChannelState>>,
    senders: Vec<Sender<WorkerMsg>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running set of decode workers.
///
/// Cheap to clone; all clones share the same workers. Dropping the last clone
/// closes the channel and joins its threads.
#[derive(Clone)]
pub struct DecodeChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for DecodeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeChannel")
            .field("workers", &self.inner.senders.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DecodeChannel {
    /// Open a channel using the built-in fragment decoder.
    pub fn open_default(config: &ChannelConfig) -> Result<Self, ChannelError> {
        Self::open(Arc::new(FragmentWorker::new(config.cull.clone())), config)
    }

    /// Start `config.workers` background threads, each running a backend
    /// built by `entry`. Fails with `Init` if any worker cannot start.
    pub fn open(entry: Arc<dyn WorkerEntry>, config: &ChannelConfig) -> Result<Self, ChannelError> {
        let _span = tracing::info_span!("decode_channel_open", workers = config.workers).entered();
        let worker_count = config.workers.max(1);
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<WorkerEvent>();

        let mut senders = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count + 1);

        for index in 0..worker_count {
            let (tx, rx) = crossbeam_channel::unbounded();
            let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
            let entry = entry.clone();
            let events = event_tx.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("fragstream-decode-{index}"))
                .spawn(move || match entry.start(index) {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        run_worker(index, backend, rx, events);
                    }
                    Err(reason) => {
                        let _ = ready_tx.send(Err(reason));
                    }
                });

            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    abort_startup(&senders, threads);
                    return Err(ChannelError::Init(e.to_string()));
                }
            };
            let ready = ready_rx
                .recv()
                .unwrap_or_else(|_| Err(format!("worker {index} exited during startup")));
            threads.push(handle);
            if let Err(reason) = ready {
                tracing::error!(worker = index, %reason, "decode worker failed to start");
                abort_startup(&senders, threads);
                return Err(ChannelError::Init(reason));
            }
            senders.push(tx);
        }
        drop(event_tx);

        let state = Arc::new(Mutex::new(ChannelState::default()));
        let router_state = state.clone();
        let router = std::thread::Builder::new()
            .name("fragstream-decode-router".into())
            .spawn(move || route_events(event_rx, router_state));
        match router {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                abort_startup(&senders, threads);
                return Err(ChannelError::Init(e.to_string()));
            }
        }

        tracing::info!(workers = worker_count, "decode channel open");
        Ok(Self {
            inner: Arc::new(Inner {
                state,
                senders,
                threads: Mutex::new(threads),
            }),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Requests sent but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// Send a payload to the model's worker for decoding.
    pub fn decode(
        &self,
        payload: Vec<u8>,
        model_id: impl Into<ModelId>,
    ) -> Result<Pending<GeometryHandle>, ChannelError> {
        let model = model_id.into();
        let worker = self.worker_for(&model);
        let mut st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        if st.dead_workers.contains(&worker) {
            return Err(ChannelError::WorkerCrashed(worker));
        }
        if st.in_flight_decodes.contains(&model) {
            return Err(ChannelError::DuplicateInFlight(model));
        }

        let request = st.next_request_id();
        let (reply, rx) = crossbeam_channel::bounded(1);
        st.pending.insert(
            request,
            PendingEntry {
                worker,
                model: model.clone(),
                kind: RequestKind::Decode,
                reply,
            },
        );
        st.in_flight_decodes.insert(model.clone());

        tracing::debug!(%request, %model, worker, bytes = payload.len(), "decode requested");
        let msg = WorkerMsg::Decode {
            request,
            model: model.clone(),
            payload,
        };
        if self.inner.senders[worker].send(msg).is_err() {
            st.pending.remove(&request);
            st.in_flight_decodes.remove(&model);
            return Err(ChannelError::WorkerCrashed(worker));
        }
        Ok(Pending::new(request, rx))
    }

    /// Recompute visibility for an already decoded model.
    pub fn refresh(
        &self,
        model_id: &ModelId,
        camera: CameraState,
    ) -> Result<Pending<GeometryHandle>, ChannelError> {
        let worker = self.worker_for(model_id);
        let mut st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        if st.dead_workers.contains(&worker) {
            return Err(ChannelError::WorkerCrashed(worker));
        }

        let request = st.next_request_id();
        let (reply, rx) = crossbeam_channel::bounded(1);
        st.pending.insert(
            request,
            PendingEntry {
                worker,
                model: model_id.clone(),
                kind: RequestKind::Refresh,
                reply,
            },
        );

        tracing::trace!(%request, model = %model_id, worker, "refresh requested");
        let msg = WorkerMsg::Refresh {
            request,
            model: model_id.clone(),
            camera,
        };
        if self.inner.senders[worker].send(msg).is_err() {
            st.pending.remove(&request);
            return Err(ChannelError::WorkerCrashed(worker));
        }
        Ok(Pending::new(request, rx))
    }

    /// Release channel-side geometry for a model.
    ///
    /// Outstanding requests for the model resolve with `Disposed`. Unknown
    /// ids and closed channels are a no-op.
    pub fn dispose(&self, model_id: &ModelId) {
        let worker = self.worker_for(model_id);
        let abandoned: Vec<PendingEntry> = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.in_flight_decodes.remove(model_id);
            let ids: Vec<RequestId> = st
                .pending
                .iter()
                .filter(|(_, e)| &e.model == model_id)
                .map(|(id, _)| *id)
                .collect();
            let abandoned = ids
                .into_iter()
                .filter_map(|id| st.pending.remove(&id))
                .collect();
            let _ = self.inner.senders[worker].send(WorkerMsg::Dispose {
                model: model_id.clone(),
            });
            abandoned
        };
        for entry in abandoned {
            let _ = entry
                .reply
                .send(Err(ChannelError::Disposed(entry.model.clone())));
        }
        tracing::debug!(model = %model_id, "dispose requested");
    }

    /// Stop all workers. Every outstanding request resolves with `Closed`.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let drained: Vec<PendingEntry> = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.in_flight_decodes.clear();
            st.pending.drain().map(|(_, e)| e).collect()
        };
        let failed = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(ChannelError::Closed));
        }
        for sender in &self.inner.senders {
            let _ = sender.send(WorkerMsg::Shutdown);
        }
        tracing::info!(failed, "decode channel closed");
    }

    fn worker_for(&self, model: &ModelId) -> usize {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        (hasher.finish() % self.inner.senders.len() as u64) as usize
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        lock_state(&self.inner.state)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let drained: Vec<PendingEntry> = {
            let mut st = lock_state(&self.state);
            st.closed = true;
            st.pending.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            let _ = entry.reply.send(Err(ChannelError::Closed));
        }
        for sender in &self.senders {
            let _ = sender.send(WorkerMsg::Shutdown);
        }
        let threads = std::mem::take(
            self.threads
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in threads {
            let _ = handle.join();
        }
    }
}

fn lock_state(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn abort_startup(senders: &[Sender<WorkerMsg>], threads: Vec<JoinHandle<()>>) {
    for sender in senders {
        let _ = sender.send(WorkerMsg::Shutdown);
    }
    for handle in threads {
        let _ = handle.join();
    }
}

/// Match worker replies to pending requests by correlation id.
fn route_events(events: Receiver<WorkerEvent>, state: Arc<Mutex<ChannelState>>) {
    while let Ok(event) = events.recv() {
        match event {
            WorkerEvent::Reply { request, result } => {
                let entry = {
                    let mut st = lock_state(&state);
                    let entry = st.pending.remove(&request);
                    if let Some(e) = &entry {
                        if e.kind == RequestKind::Decode {
                            st.in_flight_decodes.remove(&e.model);
                        }
                    }
                    entry
                };
                match entry {
                    Some(entry) => {
                        let _ = entry.reply.send(result);
                    }
                    None => tracing::trace!(%request, "dropping reply for settled request"),
                }
            }
            WorkerEvent::Crashed { worker } => {
                let failed: Vec<PendingEntry> = {
                    let mut st = lock_state(&state);
                    st.dead_workers.insert(worker);
                    let ids: Vec<RequestId> = st
                        .pending
                        .iter()
                        .filter(|(_, e)| e.worker == worker)
                        .map(|(id, _)| *id)
                        .collect();
                    let failed: Vec<PendingEntry> =
                        ids.into_iter().filter_map(|id| st.pending.remove(&id)).collect();
                    for e in &failed {
                        if e.kind == RequestKind::Decode {
                            st.in_flight_decodes.remove(&e.model);
                        }
                    }
                    failed
                };
                tracing::error!(worker, failed = failed.len(), "decode worker crashed");
                for entry in failed {
                    let _ = entry.reply.send(Err(ChannelError::WorkerCrashed(worker)));
                }
            }
        }
    }
}
