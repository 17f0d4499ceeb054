//! Terminal instances that outlive the surfaces rendering them.

use std::collections::HashMap;

use ctower_vt::{fit, ContainerSize, GeometryOptions, TermSize, VtTerminal};
use tokio_util::sync::CancellationToken;

use crate::model::PersistKey;
use crate::sink::{default_key_interceptor, InputTarget, KeyInterceptor, Slot};

/// Opaque id of a view surface an instance is mounted into.
pub type SurfaceId = u64;

/// Identifies one lifetime of a cached instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceHandle {
    pub key: PersistKey,
    pub generation: u64,
}

/// A display engine plus everything bound to it.
pub struct CachedInstance {
    generation: u64,
    vt: VtTerminal,
    options: GeometryOptions,
    surface: Option<SurfaceId>,
    container: Option<ContainerSize>,
    last_geometry: TermSize,
    visible: bool,
    input: Slot<InputTarget>,
    keys: Slot<KeyInterceptor>,
    teardown: CancellationToken,
}

impl CachedInstance {
    fn new(generation: u64, options: GeometryOptions) -> Self {
        let size = TermSize::default();
        Self {
            generation,
            vt: VtTerminal::new(size),
            options,
            surface: None,
            container: None,
            last_geometry: size,
            visible: false,
            input: Slot::new(InputTarget::Detached),
            keys: Slot::new(default_key_interceptor()),
            teardown: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn vt(&self) -> &VtTerminal {
        &self.vt
    }

    pub fn vt_mut(&mut self) -> &mut VtTerminal {
        &mut self.vt
    }

    pub fn options(&self) -> GeometryOptions {
        self.options
    }

    pub fn set_font_size(&mut self, font_size: u16) {
        self.options.font_size = font_size;
    }

    pub fn surface(&self) -> Option<SurfaceId> {
        self.surface
    }

    pub fn container(&self) -> Option<ContainerSize> {
        self.container
    }

    pub fn set_container(&mut self, container: ContainerSize) {
        self.container = Some(container);
    }

    pub fn last_geometry(&self) -> TermSize {
        self.last_geometry
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Set visibility. Returns the previous value.
    pub fn set_visible(&mut self, visible: bool) -> bool {
        std::mem::replace(&mut self.visible, visible)
    }

    pub fn input_target(&self) -> &InputTarget {
        self.input.get()
    }

    /// Point the input subscription somewhere else. No-op if unchanged.
    pub fn rebind_input(&mut self, target: InputTarget) {
        if self.input.get() != &target {
            self.input.rebind(target);
        }
    }

    pub fn input_rebinds(&self) -> u64 {
        self.input.rebinds()
    }

    pub fn key_interceptor(&self) -> KeyInterceptor {
        self.keys.get().clone()
    }

    pub fn rebind_keys(&mut self, interceptor: KeyInterceptor) {
        self.keys.rebind(interceptor);
    }

    /// Cancelled when the current surface is torn down.
    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    /// Token for a connect starting now. A token left cancelled by an
    /// earlier teardown is replaced.
    pub(crate) fn connect_token(&mut self) -> CancellationToken {
        if self.teardown.is_cancelled() {
            self.teardown = CancellationToken::new();
        }
        self.teardown.clone()
    }

    /// Move the instance into `surface` and repaint.
    pub fn mount(&mut self, surface: SurfaceId, container: ContainerSize) {
        if self.teardown.is_cancelled() {
            self.teardown = CancellationToken::new();
        }
        self.surface = Some(surface);
        self.container = Some(container);
        self.visible = true;
        self.refit();
        self.vt.refresh();
    }

    fn unmount(&mut self) {
        self.teardown.cancel();
        self.surface = None;
        self.visible = false;
    }

    /// Recompute the grid from the container and apply it to the display engine.
    ///
    /// Returns the fitted size, or `None` when the container is missing or empty.
    pub fn refit(&mut self) -> Option<TermSize> {
        let size = fit(self.container?, &self.options)?;
        self.vt.resize(size);
        self.last_geometry = size;
        Some(size)
    }

    /// Drop buffer contents and scrollback.
    pub fn reset_buffer(&mut self) {
        self.vt.reset();
    }
}

/// Cached instances keyed by `projectId:tabId[:split]`.
#[derive(Default)]
pub struct InstanceCache {
    instances: HashMap<PersistKey, CachedInstance>,
    next_generation: u64,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the instance for `key`, creating it if needed.
    ///
    /// An instance built for a different geometry mode is disposed and
    /// recreated. Returns the handle and whether the instance is new.
    pub fn acquire(&mut self, key: &PersistKey, options: GeometryOptions) -> (InstanceHandle, bool) {
        if let Some(instance) = self.instances.get_mut(key) {
            if instance.options.same_mode(&options) {
                instance.options = options;
                instance.vt.refresh();
                let handle = InstanceHandle {
                    key: key.clone(),
                    generation: instance.generation,
                };
                return (handle, false);
            }
            log::debug!("geometry mode changed for {key}, recreating instance");
            self.evict(key);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.instances
            .insert(key.clone(), CachedInstance::new(generation, options));
        let handle = InstanceHandle {
            key: key.clone(),
            generation,
        };
        (handle, true)
    }

    /// Detach the surface but keep the instance. Returns `false` if none is cached.
    pub fn release(&mut self, key: &PersistKey) -> bool {
        match self.instances.get_mut(key) {
            Some(instance) => {
                instance.unmount();
                true
            }
            None => false,
        }
    }

    /// Dispose the instance and its subscription.
    pub fn evict(&mut self, key: &PersistKey) -> Option<CachedInstance> {
        let instance = self.instances.remove(key)?;
        instance.teardown.cancel();
        Some(instance)
    }

    pub fn get(&self, key: &PersistKey) -> Option<&CachedInstance> {
        self.instances.get(key)
    }

    pub fn get_mut(&mut self, key: &PersistKey) -> Option<&mut CachedInstance> {
        self.instances.get_mut(key)
    }

    pub fn contains(&self, key: &PersistKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PersistKey, &mut CachedInstance)> {
        self.instances.iter_mut()
    }
}
