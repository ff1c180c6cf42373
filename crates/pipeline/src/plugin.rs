use std::collections::HashMap;

use parking_lot::Mutex;

/// Errors from a vendor computational-photography plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin load failed: {0}")]
    LoadFailed(String),
    #[error("plugin not initialized")]
    NotInitialized,
    #[error("plugin set rejected index {0}")]
    SetRejected(u32),
    #[error("plugin process failed: {0}")]
    ProcessFailed(String),
    #[error("plugin get rejected index {0}")]
    GetRejected(u32),
}

/// Contract with one opaque vendor plugin handle.
///
/// Calls on a single handle are serialized by [`Capability`]; `process` is
/// never concurrent with `set`/`get`.
pub trait VendorPlugin: Send {
    fn name(&self) -> &str;
    fn init(&mut self) -> Result<(), PluginError>;
    fn set(&mut self, index: u32, payload: &[u8]) -> Result<(), PluginError>;
    fn process(&mut self) -> Result<(), PluginError>;
    fn get(&mut self, index: u32) -> Result<Vec<u8>, PluginError>;
    fn deinit(&mut self) -> Result<(), PluginError>;
}

/// The optional features a session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    LowLightFusion,
    ObjectTracking,
    BestPhoto,
    BlurDetect,
    Deblur,
    JpegTuning,
    HighlightVideo,
}

enum CapabilityState {
    Ready(Box<dyn VendorPlugin>),
    Disabled,
}

/// One optional feature with a uniform available/init/process/shutdown
/// lifecycle.
///
/// Load or process failure downgrades the capability to disabled for the
/// rest of the session; the pipeline never aborts because a plugin died.
pub struct Capability {
    kind: CapabilityKind,
    state: Mutex<CapabilityState>,
}

impl Capability {
    /// Load and initialize a plugin; a failed loader or init yields a
    /// disabled capability, not an error.
    pub fn load<F>(kind: CapabilityKind, loader: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn VendorPlugin>, PluginError>,
    {
        let state = match loader() {
            Ok(mut plugin) => match plugin.init() {
                Ok(()) => CapabilityState::Ready(plugin),
                Err(err) => {
                    log::warn!("capability {kind:?}: init failed, disabling: {err}");
                    CapabilityState::Disabled
                }
            },
            Err(err) => {
                log::warn!("capability {kind:?}: load failed, disabling: {err}");
                CapabilityState::Disabled
            }
        };
        Self {
            kind,
            state: Mutex::new(state),
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    /// Whether the feature survived load/init and has not been downgraded.
    pub fn available(&self) -> bool {
        matches!(*self.state.lock(), CapabilityState::Ready(_))
    }

    /// Run a closure against the plugin handle, serialized per handle.
    ///
    /// Returns `None` when disabled. An error from the closure downgrades
    /// the capability and is logged, honoring the plugin-failure contract.
    pub fn with_plugin<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn VendorPlugin) -> Result<R, PluginError>,
    {
        let mut state = self.state.lock();
        let CapabilityState::Ready(plugin) = &mut *state else {
            return None;
        };
        match f(plugin.as_mut()) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("capability {:?}: disabled after failure: {err}", self.kind);
                *state = CapabilityState::Disabled;
                None
            }
        }
    }

    /// Deinit and drop the plugin handle.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let CapabilityState::Ready(plugin) = &mut *state
            && let Err(err) = plugin.deinit()
        {
            log::warn!("capability {:?}: deinit failed: {err}", self.kind);
        }
        *state = CapabilityState::Disabled;
    }
}

/// The capability objects attached to a session at construction time.
#[derive(Default)]
pub struct CapabilitySet {
    caps: HashMap<CapabilityKind, Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a capability; replaces any previous one of the same kind.
    pub fn attach(&mut self, capability: Capability) {
        self.caps.insert(capability.kind(), capability);
    }

    pub fn get(&self, kind: CapabilityKind) -> Option<&Capability> {
        self.caps.get(&kind)
    }

    /// Whether `kind` is attached and still available.
    pub fn available(&self, kind: CapabilityKind) -> bool {
        self.get(kind).is_some_and(|c| c.available())
    }

    /// Shut down every attached capability.
    pub fn shutdown_all(&self) {
        for capability in self.caps.values() {
            capability.shutdown();
        }
    }
}
