use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use fragstream_common::{CameraState, ModelId};

use crate::channel::{ChannelError, RequestId};
use crate::config::CullConfig;
use crate::cull::{VisibilitySet, compute_visibility};
use crate::geometry::{DecodedGeometry, GeometryHandle};

/// CPU-bound decode and culling work run inside one worker thread.
pub trait DecodeBackend: Send {
    fn decode(&mut self, model_id: &ModelId, payload: &[u8]) -> Result<DecodedGeometry, String>;

    fn refresh(&mut self, geometry: &DecodedGeometry, camera: &CameraState) -> VisibilitySet;
}

/// Entry point that builds one backend per worker thread.
///
/// `start` runs on the new thread; returning an error aborts `open`.
pub trait WorkerEntry: Send + Sync {
    fn start(&self, worker: usize) -> Result<Box<dyn DecodeBackend>, String>;
}

/// Default backend: decodes fragment payloads with `fragstream-format`.
#[derive(Debug, Clone, Default)]
pub struct FragmentWorker {
    pub cull: CullConfig,
}

impl FragmentWorker {
    pub fn new(cull: CullConfig) -> Self {
        Self { cull }
    }
}

impl DecodeBackend for FragmentWorker {
    fn decode(&mut self, model_id: &ModelId, payload: &[u8]) -> Result<DecodedGeometry, String> {
        let _span = tracing::info_span!("decode_payload", model = %model_id).entered();
        let model = fragstream_format::decode(payload).map_err(|e| e.to_string())?;
        Ok(DecodedGeometry::new(model, self.cull.cell_size))
    }

    fn refresh(&mut self, geometry: &DecodedGeometry, camera: &CameraState) -> VisibilitySet {
        compute_visibility(geometry, camera, &self.cull)
    }
}

impl WorkerEntry for FragmentWorker {
    fn start(&self, _worker: usize) -> Result<Box<dyn DecodeBackend>, String> {
        Ok(Box::new(self.clone()))
    }
}

pub(crate) enum WorkerMsg {
    Decode {
        request: RequestId,
        model: ModelId,
        payload: Vec<u8>,
    },
    Refresh {
        request: RequestId,
        model: ModelId,
        camera: CameraState,
    },
    Dispose {
        model: ModelId,
    },
    Shutdown,
}

pub(crate) enum WorkerEvent {
    Reply {
        request: RequestId,
        result: Result<GeometryHandle, ChannelError>,
    },
    Crashed {
        worker: usize,
    },
}

/// Geometry records held by one worker, keyed by model.
struct Record {
    geometry: Arc<DecodedGeometry>,
    revision: u64,
}

pub(crate) fn run_worker(
    index: usize,
    mut backend: Box<dyn DecodeBackend>,
    requests: Receiver<WorkerMsg>,
    events: Sender<WorkerEvent>,
) {
    let mut records: HashMap<ModelId, Record> = HashMap::new();
    // One counter per worker: revisions never repeat, even across dispose,
    // and nothing is kept for models that are gone.
    let mut revision: u64 = 0;

    while let Ok(msg) = requests.recv() {
        match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Dispose { model } => {
                if records.remove(&model).is_some() {
                    tracing::debug!(worker = index, %model, "released model geometry");
                }
            }
            WorkerMsg::Decode {
                request,
                model,
                payload,
            } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| backend.decode(&model, &payload)));
                let decoded = match outcome {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        tracing::error!(worker = index, %model, "decode backend panicked");
                        let _ = events.send(WorkerEvent::Crashed { worker: index });
                        return;
                    }
                };
                let result = match decoded {
                    Ok(geometry) => {
                        revision += 1;
                        let geometry = Arc::new(geometry);
                        let visibility = VisibilitySet::all(&geometry.model);
                        records.insert(
                            model.clone(),
                            Record {
                                geometry: geometry.clone(),
                                revision,
                            },
                        );
                        Ok(GeometryHandle {
                            model_id: model,
                            revision,
                            geometry,
                            visibility,
                        })
                    }
                    Err(reason) => {
                        tracing::warn!(worker = index, %model, %reason, "decode failed");
                        Err(ChannelError::Decode { model, reason })
                    }
                };
                let _ = events.send(WorkerEvent::Reply { request, result });
            }
            WorkerMsg::Refresh {
                request,
                model,
                camera,
            } => {
                let Some(record) = records.get_mut(&model) else {
                    let _ = events.send(WorkerEvent::Reply {
                        request,
                        result: Err(ChannelError::UnknownModel(model)),
                    });
                    continue;
                };
                let geometry = record.geometry.clone();
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| backend.refresh(&geometry, &camera)));
                let Ok(visibility) = outcome else {
                    tracing::error!(worker = index, %model, "refresh backend panicked");
                    let _ = events.send(WorkerEvent::Crashed { worker: index });
                    return;
                };
                revision += 1;
                record.revision = revision;
                let _ = events.send(WorkerEvent::Reply {
                    request,
                    result: Ok(GeometryHandle {
                        model_id: model,
                        revision: record.revision,
                        geometry,
                        visibility,
                    }),
                });
            }
        }
    }
    tracing::debug!(worker = index, models = records.len(), "decode worker stopped");
}
