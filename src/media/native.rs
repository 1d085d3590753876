use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use super::{BindOptions, MediaStream, RenderBackend};
use crate::internal::data_types::TargetId;

#[derive(Clone)]
pub struct AttachedView {
    pub stream: Arc<MediaStream>,
    pub options: BindOptions,
}

/// what each native view currently shows. native renderers hold a clone and
/// look their view up by target id
#[derive(Clone, Default)]
pub struct ViewRegistry {
    views: Arc<Mutex<HashMap<TargetId, AttachedView>>>,
}

impl ViewRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<TargetId, AttachedView>> {
        match self.views.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, target: &str) -> Option<AttachedView> {
        self.lock().get(target).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// attaches streams to native views by reference. no playback step
#[derive(Default)]
pub struct NativeViewBackend {
    views: ViewRegistry,
}

impl NativeViewBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn views(&self) -> ViewRegistry {
        self.views.clone()
    }
}

impl RenderBackend for NativeViewBackend {
    fn attach(
        &mut self,
        target: &TargetId,
        stream: &Arc<MediaStream>,
        options: &BindOptions,
    ) -> Result<()> {
        let view = AttachedView {
            stream: stream.clone(),
            options: *options,
        };
        if self.views.lock().insert(target.clone(), view).is_some() {
            log::warn!("native view {} was attached without a detach", target);
        }
        Ok(())
    }

    fn detach(&mut self, target: &TargetId) {
        self.views.lock().remove(target);
    }

    fn apply_options(&mut self, target: &TargetId, options: &BindOptions) {
        if let Some(view) = self.views.lock().get_mut(target) {
            view.options = *options;
        }
    }
}
