//! Composition root for wrapper chains.

use std::rc::Rc;
use std::sync::OnceLock;

use crate::atom::AtomChannelWrapper;
use crate::channel::Channel;
use crate::classify::AtomClassifier;
use crate::config::{WrapperConfig, WrapperLayers};
use crate::error::{ChannelError, Result};
use crate::runlist::{RunlistChannelWrapper, RunlistScheduler};
use crate::semaphore::SemaphoreChannelWrapper;

/// External objects the wrapper layers consume.
#[derive(Default)]
pub struct Collaborators {
    pub classifier: Option<Box<dyn AtomClassifier>>,
    pub scheduler: Option<Rc<dyn RunlistScheduler>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classifier(mut self, classifier: impl AtomClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    pub fn with_scheduler(mut self, scheduler: Rc<dyn RunlistScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ChannelWrapperManager {
    config: WrapperConfig,
}

impl ChannelWrapperManager {
    pub fn new(config: WrapperConfig) -> Self {
        Self { config }
    }

    /// Manager using [`WrapperConfig::global`].
    pub fn global() -> &'static ChannelWrapperManager {
        static GLOBAL: OnceLock<ChannelWrapperManager> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(WrapperConfig::global().clone()))
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Decide which layers `raw` gets.
    ///
    /// A requested layer whose prerequisites are missing is skipped. A layer that is only there
    /// because a higher one needs it must be supported, or the whole request fails.
    pub fn plan(&self, raw: &dyn Channel, collaborators: &Collaborators) -> Result<WrapperLayers> {
        let requested = self.config.layers;
        let mut enabled = requested;

        if enabled.contains(WrapperLayers::RUNLIST) && collaborators.scheduler.is_none() {
            tracing::warn!("runlist layer requested without a scheduler; skipping it");
            enabled.remove(WrapperLayers::RUNLIST);
        }

        let semaphore_supported = SemaphoreChannelWrapper::is_supported(raw);
        if enabled.contains(WrapperLayers::SEMAPHORE) && !semaphore_supported {
            tracing::warn!("channel cannot host the semaphore layer; skipping it");
            enabled.remove(WrapperLayers::SEMAPHORE);
        }

        let atom_supported =
            collaborators.classifier.is_some() && AtomChannelWrapper::is_supported(raw);
        if enabled.contains(WrapperLayers::ATOM) && !atom_supported {
            tracing::warn!("channel cannot host the atom layer; skipping it");
            enabled.remove(WrapperLayers::ATOM);
        }

        let needed = enabled.with_dependencies();
        let missing = needed - enabled;
        if missing.contains(WrapperLayers::SEMAPHORE) && !semaphore_supported {
            return Err(ChannelError::Unsupported(
                "runlist layer needs a semaphore layer this channel cannot host",
            ));
        }
        if missing.contains(WrapperLayers::ATOM) && !atom_supported {
            return Err(ChannelError::Unsupported(
                "method-inserting layers need an atom layer this channel cannot host",
            ));
        }
        if !missing.is_empty() {
            tracing::debug!(?missing, "enabling required wrapper layers");
        }
        Ok(needed)
    }

    /// Stack the planned layers on `raw`, leaf outward: atom, semaphore, runlist.
    ///
    /// Returns the outermost layer and registers it in the chain head.
    pub fn wrap_channel(
        &self,
        raw: Rc<dyn Channel>,
        mut collaborators: Collaborators,
    ) -> Result<Rc<dyn Channel>> {
        let layers = self.plan(&*raw, &collaborators)?;
        let mut channel = raw;

        if layers.contains(WrapperLayers::ATOM) {
            let classifier = collaborators
                .classifier
                .take()
                .ok_or(ChannelError::Unsupported("atom layer needs a classifier"))?;
            channel = push_layer(Rc::new(AtomChannelWrapper::new(channel, classifier)));
        }
        if layers.contains(WrapperLayers::SEMAPHORE) {
            channel = push_layer(Rc::new(SemaphoreChannelWrapper::new(
                channel,
                self.config.semaphore.clone(),
                self.config.restore_iteration_limit,
            )));
        }
        if layers.contains(WrapperLayers::RUNLIST) {
            let scheduler = collaborators
                .scheduler
                .take()
                .ok_or(ChannelError::Unsupported("runlist layer needs a scheduler"))?;
            if !RunlistChannelWrapper::is_supported(&*channel) {
                return Err(ChannelError::Unsupported(
                    "runlist layer needs a semaphore layer underneath",
                ));
            }
            channel = push_layer(Rc::new(RunlistChannelWrapper::new(channel, scheduler)));
        }

        tracing::debug!(?layers, "wrapped channel");
        Ok(channel)
    }
}

fn push_layer(layer: Rc<dyn Channel>) -> Rc<dyn Channel> {
    if let Some(head) = layer.chain_head() {
        head.set_outermost(&layer);
    }
    layer
}
