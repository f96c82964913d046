//! Scheduler notification on flush boundaries.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::base::ChannelWrapperBase;
use crate::chain::ChainHead;
use crate::channel::{Channel, EngineId, HeaderKind, ObjectHandle, WriteKind};
use crate::error::Result;
use crate::guard::ScopedFlag;

/// Pointers sampled right after a flush that moved them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPointers {
    pub put: u32,
    pub gp_put: u32,
}

/// External scheduling object told about every flush that published new work.
///
/// `channel` is the outermost layer of the flushed chain; the scheduler may write inserted
/// methods or flush again through it.
pub trait RunlistScheduler {
    fn channel_flushed(
        &self,
        channel: &dyn Channel,
        engine: Option<EngineId>,
        pointers: FlushPointers,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushNotification {
    pub engine: Option<EngineId>,
    pub pointers: FlushPointers,
}

/// A bookkeeping method written as inserted methods on every notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedMethod {
    pub subchannel: u32,
    pub method: u32,
    pub data: u32,
}

/// Scheduler that keeps a log of notifications and can insert one method per flush.
#[derive(Debug, Default)]
pub struct FlushRecorder {
    notifications: RefCell<Vec<FlushNotification>>,
    insert: Option<InsertedMethod>,
}

impl FlushRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inserting(method: InsertedMethod) -> Self {
        Self {
            insert: Some(method),
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> Vec<FlushNotification> {
        self.notifications.borrow().clone()
    }
}

impl RunlistScheduler for FlushRecorder {
    fn channel_flushed(
        &self,
        channel: &dyn Channel,
        engine: Option<EngineId>,
        pointers: FlushPointers,
    ) -> Result<()> {
        self.notifications
            .borrow_mut()
            .push(FlushNotification { engine, pointers });
        if let Some(insert) = self.insert {
            channel.begin_inserted_methods()?;
            channel.write(insert.subchannel, insert.method, &[insert.data])?;
            channel.end_inserted_methods()?;
            channel.flush()?;
        }
        Ok(())
    }
}

pub struct RunlistChannelWrapper {
    base: ChannelWrapperBase,
    scheduler: Rc<dyn RunlistScheduler>,
    last_engine: Cell<Option<EngineId>>,
    flushing: Cell<bool>,
    notifying: Cell<bool>,
}

impl RunlistChannelWrapper {
    pub fn new(inner: Rc<dyn Channel>, scheduler: Rc<dyn RunlistScheduler>) -> Self {
        Self {
            base: ChannelWrapperBase::new(inner),
            scheduler,
            last_engine: Cell::new(None),
            flushing: Cell::new(false),
            notifying: Cell::new(false),
        }
    }

    /// Scheduling needs the semaphore ledger underneath to survive its inserted methods.
    pub fn is_supported(channel: &dyn Channel) -> bool {
        channel.semaphore_wrapper().is_some()
    }

    /// Engine the next notification is reported against.
    pub fn engine(&self) -> Result<Option<EngineId>> {
        match self.last_engine.get() {
            Some(engine) => Ok(Some(engine)),
            None => self.base.inner().engine(),
        }
    }

    /// True while the scheduler is handling a flush notification.
    pub fn is_notifying(&self) -> bool {
        self.notifying.get()
    }

    fn note_subchannel(&self, subchannel: u32) -> Result<()> {
        // An unbound subchannel keeps the previous engine.
        if let Some(engine) = self.base.inner().object_engine(subchannel)? {
            self.last_engine.set(Some(engine));
        }
        Ok(())
    }

    fn pointers(&self) -> Result<FlushPointers> {
        let inner = self.base.inner();
        Ok(FlushPointers {
            put: inner.put()?,
            gp_put: inner.gp_put()?,
        })
    }
}

impl Channel for RunlistChannelWrapper {
    fn wrapped(&self) -> Option<&dyn Channel> {
        Some(self.base.inner())
    }

    fn chain_head(&self) -> Option<ChainHead> {
        self.base.chain_head()
    }

    fn runlist_wrapper(&self) -> Option<&RunlistChannelWrapper> {
        Some(self)
    }

    fn write_method(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        self.note_subchannel(subchannel)?;
        self.base.inner().write_method(kind, subchannel, method, data)
    }

    fn write_header(
        &self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        self.note_subchannel(subchannel)?;
        self.base.inner().write_header(kind, subchannel, method, count)
    }

    fn flush(&self) -> Result<()> {
        if self.flushing.get() {
            return self.base.inner().flush();
        }
        let _flushing = ScopedFlag::raise(&self.flushing);

        let before = self.pointers()?;
        self.base.inner().flush()?;
        let after = self.pointers()?;
        if after == before {
            return Ok(());
        }

        let engine = self.engine()?;
        tracing::debug!(
            ?engine,
            put = after.put,
            gp_put = after.gp_put,
            "notifying scheduler of flush"
        );
        let outermost = self.base.outermost();
        let _notifying = ScopedFlag::raise(&self.notifying);
        self.scheduler.channel_flushed(&*outermost, engine, after)
    }

    fn unset_object(&self, handle: ObjectHandle) -> Result<()> {
        // The scheduler may still reference the object.
        self.base.outermost().wait_idle()?;
        self.base.inner().unset_object(handle)
    }
}
