use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fragstream_common::{CameraHandle, ModelId, WeakCamera};
use fragstream_convert::{CancelToken, ConversionJob, ConvertOptions, Converter};
use fragstream_decode::{ChannelError, DecodeChannel, GeometryHandle, Pending, WorkerEntry};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{DetachSignal, Model, ModelRegistry};
use crate::scheduler::{SchedulerStats, UpdateScheduler};

const WAIT_SLICE: Duration = Duration::from_millis(10);

struct LoadRequest {
    id: ModelId,
    epoch: u64,
    pending: Pending<GeometryHandle>,
}

/// Entry point of the engine: owns the decode channel, the model registry
/// and the update scheduler, and reclaims all of them on shutdown.
///
/// Lives on one control thread. Background results are applied only inside
/// [`poll`](Self::poll) and [`wait_idle`](Self::wait_idle).
pub struct FragmentModels {
    channel: DecodeChannel,
    registry: ModelRegistry,
    scheduler: UpdateScheduler,
    loads: Vec<LoadRequest>,
    jobs: Vec<CancelToken>,
    camera: Option<WeakCamera>,
    shut_down: bool,
}

impl FragmentModels {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let channel = DecodeChannel::open_default(&config.channel)?;
        Ok(Self::from_channel(channel, config))
    }

    /// Build on a custom decode backend.
    pub fn with_entry(entry: Arc<dyn WorkerEntry>, config: &EngineConfig) -> Result<Self, EngineError> {
        let channel = DecodeChannel::open(entry, &config.channel)?;
        Ok(Self::from_channel(channel, config))
    }

    fn from_channel(channel: DecodeChannel, config: &EngineConfig) -> Self {
        Self {
            registry: ModelRegistry::with_release(Box::new(channel.clone())),
            channel,
            scheduler: UpdateScheduler::new(config.scheduler.clone()),
            loads: Vec::new(),
            jobs: Vec::new(),
            camera: None,
            shut_down: false,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Mutable access, mainly to subscribe to registry events.
    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }

    pub fn channel(&self) -> &DecodeChannel {
        &self.channel
    }

    pub fn model(&self, id: &ModelId) -> Option<&Model> {
        self.registry.get(id)
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn pending_loads(&self) -> usize {
        self.loads.len()
    }

    /// Conversions still running that `shutdown` would cancel.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.iter().filter(|t| !t.is_done()).count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Start decoding a payload as model `id`. The model is registered as
    /// `Pending` right away and becomes `Ready` or `Failed` in a later poll.
    ///
    /// Returns the epoch of the new model.
    pub fn load(&mut self, payload: Vec<u8>, id: impl Into<ModelId>) -> Result<u64, EngineError> {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        let id = id.into();
        let epoch = self.registry.add_pending(id.clone())?.epoch();
        match self.channel.decode(payload, id.clone()) {
            Ok(pending) => {
                self.loads.push(LoadRequest { id, epoch, pending });
                Ok(epoch)
            }
            Err(e) => {
                self.registry.mark_failed(&id, epoch, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Read an exported payload from disk and load it.
    pub fn load_file(&mut self, path: impl AsRef<Path>, id: impl Into<ModelId>) -> Result<u64, EngineError> {
        let payload = fragstream_format::import_from(path)?;
        self.load(payload, id)
    }

    /// Camera bound to every model as it becomes ready. Models already ready
    /// are bound now.
    pub fn bind_camera(&mut self, camera: &CameraHandle) {
        self.camera = Some(camera.downgrade());
        for id in self.registry.ids() {
            if let Some(model) = self.registry.get_mut(&id).filter(|m| m.is_ready()) {
                model.use_camera(camera);
            }
        }
    }

    pub fn use_camera(&mut self, id: &ModelId, camera: &CameraHandle) -> bool {
        match self.registry.get_mut(id) {
            Some(model) => {
                model.use_camera(camera);
                true
            }
            None => false,
        }
    }

    pub fn attach_to_scene(&mut self, id: &ModelId) -> bool {
        match self.registry.get_mut(id) {
            Some(model) => {
                model.attach_to_scene();
                true
            }
            None => false,
        }
    }

    /// Camera came to rest: refresh after the coalescing window.
    pub fn camera_rest(&mut self) {
        if !self.shut_down {
            self.scheduler.trigger(false, Instant::now());
        }
    }

    /// Request a refresh round; `force` skips the coalescing window.
    pub fn update(&mut self, force: bool) {
        if !self.shut_down {
            self.scheduler.trigger(force, Instant::now());
            self.poll();
        }
    }

    /// Apply finished loads and refreshes, and start a due refresh round.
    pub fn poll(&mut self) {
        if self.shut_down {
            return;
        }
        let mut i = 0;
        while i < self.loads.len() {
            match self.loads[i].pending.try_take() {
                Some(result) => {
                    let load = self.loads.swap_remove(i);
                    self.finish_load(load, result);
                }
                None => i += 1,
            }
        }
        self.scheduler
            .poll(&mut self.registry, &self.channel, Instant::now());
    }

    /// Block until every load has resolved and no refresh is queued or in
    /// flight, or until `timeout`. Returns whether that point was reached.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if self.shut_down || (self.loads.is_empty() && self.scheduler.is_idle()) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            if let Some(load) = self.loads.first_mut() {
                if let Some(result) = load.pending.wait_timeout(slice) {
                    let load = self.loads.remove(0);
                    self.finish_load(load, result);
                }
            } else {
                self.scheduler
                    .wait_idle(&mut self.registry, &self.channel, slice);
            }
        }
    }

    fn finish_load(&mut self, load: LoadRequest, result: Result<GeometryHandle, ChannelError>) {
        match result {
            Ok(handle) => {
                if !self.registry.mark_ready(&load.id, load.epoch, handle) {
                    tracing::debug!(model = %load.id, epoch = load.epoch, "late decode discarded");
                    return;
                }
                if let Some(camera) = self.camera.as_ref().and_then(WeakCamera::upgrade) {
                    if let Some(model) = self.registry.get_mut(&load.id) {
                        model.use_camera(&camera);
                        model.attach_to_scene();
                    }
                    self.scheduler.trigger(true, Instant::now());
                }
            }
            Err(ChannelError::Disposed(_)) => {
                tracing::debug!(model = %load.id, "decode abandoned by dispose");
            }
            Err(e) => {
                self.registry.mark_failed(&load.id, load.epoch, e.to_string());
            }
        }
    }

    /// Start a conversion whose job is cancelled if the engine shuts down
    /// first.
    pub fn convert(&mut self, bytes: Vec<u8>, options: ConvertOptions) -> Result<ConversionJob, EngineError> {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        let job = Converter::convert(bytes, options);
        self.jobs.retain(|t| !t.is_cancelled() && !t.is_done());
        self.jobs.push(job.cancel_token());
        Ok(job)
    }

    /// Remove a model and release its geometry. Safe to repeat.
    pub fn dispose_model(&mut self, id: &ModelId) -> Option<DetachSignal> {
        self.loads.retain(|l| &l.id != id);
        let signal = self.registry.remove(id);
        if signal.is_none() {
            self.channel.dispose(id);
        }
        signal
    }

    /// Dispose every model, close the decode channel, and cancel tracked
    /// conversions. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let _span = tracing::info_span!("engine_shutdown").entered();

        let models = self.registry.len();
        for id in self.registry.ids() {
            self.registry.remove(&id);
        }
        self.loads.clear();
        self.scheduler.cancel();
        self.channel.close();

        let jobs = self.jobs.len();
        for token in self.jobs.drain(..) {
            token.cancel();
        }
        tracing::info!(models, jobs, "engine shut down");
    }
}

impl Drop for FragmentModels {
    fn drop(&mut self) {
        self.shutdown();
    }
}
