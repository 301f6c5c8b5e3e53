use std::collections::BTreeMap;

use fragstream_common::{CameraHandle, CameraState, EventList, ModelId, WeakCamera};
use fragstream_decode::{DecodeChannel, GeometryHandle};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("model {0} is already loaded")]
    DuplicateModel(ModelId),
}

/// Lifecycle of a model's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeState {
    Pending,
    Ready,
    Failed,
    Disposed,
}

/// Something that owns decoded geometry on behalf of models.
pub trait GeometryRelease: Send {
    fn release(&self, id: &ModelId);
}

impl GeometryRelease for DecodeChannel {
    fn release(&self, id: &ModelId) {
        self.dispose(id);
    }
}

/// A loaded model as tracked by the registry.
#[derive(Debug, Clone)]
pub struct Model {
    id: ModelId,
    state: DecodeState,
    geometry: Option<GeometryHandle>,
    camera: Option<WeakCamera>,
    scene_attached: bool,
    epoch: u64,
    failure: Option<String>,
}

impl Model {
    fn new(id: ModelId, epoch: u64) -> Self {
        Self {
            id,
            state: DecodeState::Pending,
            geometry: None,
            camera: None,
            scene_attached: false,
            epoch,
            failure: None,
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == DecodeState::Ready
    }

    pub fn geometry(&self) -> Option<&GeometryHandle> {
        self.geometry.as_ref()
    }

    /// Registry-assigned serial of this incarnation of the id.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn scene_attached(&self) -> bool {
        self.scene_attached
    }

    /// Bind the camera used for culling. Only a weak reference is kept.
    pub fn use_camera(&mut self, camera: &CameraHandle) {
        self.camera = Some(camera.downgrade());
    }

    pub fn has_camera(&self) -> bool {
        self.camera_state().is_some()
    }

    /// Current state of the bound camera, if it is still alive.
    pub fn camera_state(&self) -> Option<CameraState> {
        self.camera.as_ref().and_then(WeakCamera::state)
    }

    pub fn attach_to_scene(&mut self) {
        self.scene_attached = true;
    }
}

/// Returned by [`ModelRegistry::remove`]; the scene owner uses it to take the
/// model's drawable out of the scene.
#[derive(Debug, Clone)]
pub struct DetachSignal {
    pub id: ModelId,
    pub epoch: u64,
    /// Whether the model had been attached to a scene.
    pub was_attached: bool,
    /// State the model was in just before disposal.
    pub last_state: DecodeState,
    /// The removed model, now `Disposed`, detached and without geometry.
    pub model: Model,
}

/// The set of loaded models, keyed by id.
///
/// All mutation goes through `&mut self`, and observers run synchronously
/// after the change they report.
pub struct ModelRegistry {
    models: BTreeMap<ModelId, Model>,
    next_epoch: u64,
    release: Option<Box<dyn GeometryRelease>>,
    on_item_added: EventList<Model>,
    on_item_removed: EventList<DetachSignal>,
    on_item_ready: EventList<Model>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// A registry that releases nothing on removal.
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            next_epoch: 0,
            release: None,
            on_item_added: EventList::new(),
            on_item_removed: EventList::new(),
            on_item_ready: EventList::new(),
        }
    }

    pub fn with_release(release: Box<dyn GeometryRelease>) -> Self {
        Self {
            release: Some(release),
            ..Self::new()
        }
    }

    pub fn on_item_added(&mut self) -> &mut EventList<Model> {
        &mut self.on_item_added
    }

    pub fn on_item_removed(&mut self) -> &mut EventList<DetachSignal> {
        &mut self.on_item_removed
    }

    /// Fires when a model becomes `Ready`.
    pub fn on_item_ready(&mut self) -> &mut EventList<Model> {
        &mut self.on_item_ready
    }

    /// Insert a model whose geometry is already decoded.
    pub fn add(&mut self, id: ModelId, geometry: GeometryHandle) -> Result<&Model, RegistryError> {
        let mut model = self.fresh(id.clone())?;
        model.state = DecodeState::Ready;
        model.geometry = Some(geometry);
        self.models.insert(id.clone(), model);

        let model = &self.models[&id];
        tracing::debug!(model = %id, epoch = model.epoch, "model added");
        self.on_item_added.dispatch(model);
        self.on_item_ready.dispatch(model);
        Ok(model)
    }

    /// Insert a model whose decode has not finished yet.
    pub fn add_pending(&mut self, id: ModelId) -> Result<&Model, RegistryError> {
        let model = self.fresh(id.clone())?;
        self.models.insert(id.clone(), model);

        let model = &self.models[&id];
        tracing::debug!(model = %id, epoch = model.epoch, "model added (pending)");
        self.on_item_added.dispatch(model);
        Ok(model)
    }

    fn fresh(&mut self, id: ModelId) -> Result<Model, RegistryError> {
        if self.models.contains_key(&id) {
            return Err(RegistryError::DuplicateModel(id));
        }
        self.next_epoch += 1;
        Ok(Model::new(id, self.next_epoch))
    }

    /// Pending → Ready. Returns `false` (and changes nothing) when the model is
    /// gone, not pending, or from another incarnation.
    pub fn mark_ready(&mut self, id: &ModelId, epoch: u64, geometry: GeometryHandle) -> bool {
        let Some(model) = self.live_mut(id, epoch) else {
            return false;
        };
        if model.state != DecodeState::Pending {
            return false;
        }
        model.state = DecodeState::Ready;
        model.geometry = Some(geometry);
        model.failure = None;
        tracing::debug!(model = %id, epoch, "model ready");
        self.on_item_ready.dispatch(&self.models[id]);
        true
    }

    pub fn mark_failed(&mut self, id: &ModelId, epoch: u64, reason: impl Into<String>) -> bool {
        let Some(model) = self.live_mut(id, epoch) else {
            return false;
        };
        if model.state != DecodeState::Pending {
            return false;
        }
        let reason = reason.into();
        tracing::warn!(model = %id, epoch, %reason, "model failed");
        model.state = DecodeState::Failed;
        model.failure = Some(reason);
        true
    }

    /// Replace a Ready model's geometry with a newer revision.
    pub fn update_geometry(&mut self, id: &ModelId, epoch: u64, geometry: GeometryHandle) -> bool {
        let Some(model) = self.live_mut(id, epoch) else {
            return false;
        };
        if model.state != DecodeState::Ready {
            return false;
        }
        if model
            .geometry
            .as_ref()
            .is_some_and(|g| g.revision >= geometry.revision)
        {
            return false;
        }
        model.geometry = Some(geometry);
        true
    }

    fn live_mut(&mut self, id: &ModelId, epoch: u64) -> Option<&mut Model> {
        self.models.get_mut(id).filter(|m| m.epoch == epoch)
    }

    pub fn get(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn get_mut(&mut self, id: &ModelId) -> Option<&mut Model> {
        self.models.get_mut(id)
    }

    /// All models, ordered by id.
    pub fn list(&self) -> Vec<&Model> {
        self.models.values().collect()
    }

    pub fn ids(&self) -> Vec<ModelId> {
        self.models.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    /// Dispose a model and release its geometry. Unknown ids are a no-op and
    /// fire no events.
    pub fn remove(&mut self, id: &ModelId) -> Option<DetachSignal> {
        let mut model = self.models.remove(id)?;
        if let Some(release) = &self.release {
            release.release(id);
        }
        let last_state = model.state;
        let was_attached = model.scene_attached;
        model.state = DecodeState::Disposed;
        model.geometry = None;
        model.scene_attached = false;
        let signal = DetachSignal {
            id: model.id.clone(),
            epoch: model.epoch,
            was_attached,
            last_state,
            model,
        };
        tracing::debug!(model = %signal.id, epoch = signal.epoch, "model disposed");
        self.on_item_removed.dispatch(&signal);
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use fragstream_decode::{DecodedGeometry, VisibilitySet};
    use fragstream_format::FragmentModel;

    fn handle(id: &str, revision: u64) -> GeometryHandle {
        GeometryHandle {
            model_id: ModelId::new(id),
            revision,
            geometry: Arc::new(DecodedGeometry::new(FragmentModel::default(), 16.0)),
            visibility: VisibilitySet::default(),
        }
    }

    #[derive(Clone, Default)]
    struct Released(Arc<Mutex<Vec<ModelId>>>);

    impl GeometryRelease for Released {
        fn release(&self, id: &ModelId) {
            self.0.lock().unwrap().push(id.clone());
        }
    }

    #[test]
    fn duplicate_add_fails_and_reuse_after_remove_succeeds() {
        let mut registry = ModelRegistry::new();
        let id = ModelId::new("m1");
        registry.add(id.clone(), handle("m1", 1)).unwrap();

        let err = registry.add(id.clone(), handle("m1", 2)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateModel(id.clone()));
        assert!(registry.add_pending(id.clone()).is_err());

        let signal = registry.remove(&id).unwrap();
        assert_eq!(signal.last_state, DecodeState::Ready);
        assert!(!registry.contains(&id));

        let again = registry.add(id.clone(), handle("m1", 1)).unwrap();
        assert!(again.epoch() > signal.epoch);
    }

    #[test]
    fn remove_unknown_fires_nothing() {
        let released = Released::default();
        let mut registry = ModelRegistry::with_release(Box::new(released.clone()));
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        registry
            .on_item_removed()
            .add(move |_| *counter.lock().unwrap() += 1);

        assert!(registry.remove(&ModelId::new("m1")).is_none());
        assert_eq!(*fired.lock().unwrap(), 0);
        assert!(released.0.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_releases_geometry_and_reports_attachment() {
        let released = Released::default();
        let mut registry = ModelRegistry::with_release(Box::new(released.clone()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        registry
            .on_item_removed()
            .add(move |s: &DetachSignal| sink.lock().unwrap().push(s.id.clone()));

        let id = ModelId::new("m1");
        registry.add(id.clone(), handle("m1", 1)).unwrap();
        registry.get_mut(&id).unwrap().attach_to_scene();

        let signal = registry.remove(&id).unwrap();
        assert!(signal.was_attached);
        assert_eq!(signal.last_state, DecodeState::Ready);
        assert_eq!(signal.model.state(), DecodeState::Disposed);
        assert!(signal.model.geometry().is_none());
        assert!(!signal.model.scene_attached());
        assert_eq!(*released.0.lock().unwrap(), vec![id.clone()]);
        assert_eq!(*removed.lock().unwrap(), vec![id]);
    }

    #[test]
    fn observers_fire_after_mutation() {
        let mut registry = ModelRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let sink = events.clone();
        registry.on_item_added().add(move |m: &Model| {
            sink.lock().unwrap().push(format!("added {} {:?}", m.id(), m.state()))
        });
        let sink = events.clone();
        registry.on_item_ready().add(move |m: &Model| {
            sink.lock().unwrap().push(format!("ready {} {:?}", m.id(), m.state()))
        });

        let id = ModelId::new("m1");
        let epoch = registry.add_pending(id.clone()).unwrap().epoch();
        assert!(registry.mark_ready(&id, epoch, handle("m1", 1)));

        assert_eq!(
            *events.lock().unwrap(),
            vec!["added m1 Pending".to_string(), "ready m1 Ready".to_string()]
        );
    }

    #[test]
    fn late_results_for_disposed_incarnation_are_ignored() {
        let mut registry = ModelRegistry::new();
        let id = ModelId::new("m1");
        let old_epoch = registry.add_pending(id.clone()).unwrap().epoch();
        registry.remove(&id);

        assert!(!registry.mark_ready(&id, old_epoch, handle("m1", 1)));
        assert!(!registry.contains(&id));

        let new_epoch = registry.add_pending(id.clone()).unwrap().epoch();
        assert!(!registry.mark_ready(&id, old_epoch, handle("m1", 1)));
        assert!(!registry.mark_failed(&id, old_epoch, "late"));
        assert_eq!(registry.get(&id).unwrap().state(), DecodeState::Pending);
        assert!(registry.mark_ready(&id, new_epoch, handle("m1", 1)));
    }

    #[test]
    fn failed_decode_records_reason() {
        let mut registry = ModelRegistry::new();
        let id = ModelId::new("m1");
        let epoch = registry.add_pending(id.clone()).unwrap().epoch();
        assert!(registry.mark_failed(&id, epoch, "bad magic"));

        let model = registry.get(&id).unwrap();
        assert_eq!(model.state(), DecodeState::Failed);
        assert_eq!(model.failure(), Some("bad magic"));
        // Failed is terminal for this incarnation.
        assert!(!registry.mark_ready(&id, epoch, handle("m1", 1)));
    }

    #[test]
    fn update_geometry_rejects_older_revisions() {
        let mut registry = ModelRegistry::new();
        let id = ModelId::new("m1");
        let epoch = registry.add(id.clone(), handle("m1", 2)).unwrap().epoch();

        assert!(!registry.update_geometry(&id, epoch, handle("m1", 1)));
        assert!(registry.update_geometry(&id, epoch, handle("m1", 3)));
        assert_eq!(registry.get(&id).unwrap().geometry().unwrap().revision, 3);
        assert!(!registry.update_geometry(&id, epoch + 1, handle("m1", 4)));
    }

    #[test]
    fn camera_binding_is_weak() {
        let mut registry = ModelRegistry::new();
        let id = ModelId::new("m1");
        registry.add(id.clone(), handle("m1", 1)).unwrap();

        let camera = CameraHandle::new(CameraState::default());
        registry.get_mut(&id).unwrap().use_camera(&camera);
        assert!(registry.get(&id).unwrap().has_camera());

        drop(camera);
        assert!(!registry.get(&id).unwrap().has_camera());
    }

    #[test]
    fn list_is_ordered_by_id() {
        let mut registry = ModelRegistry::new();
        for id in ["b", "a", "c"] {
            registry.add_pending(ModelId::new(id)).unwrap();
        }
        let ids: Vec<&str> = registry.list().iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
    }
}
