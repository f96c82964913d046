//! Semaphore state ledger.
//!
//! [`SemaphoreChannelWrapper`] watches every method write, caches the values of methods the
//! class tables mark as semaphore configuration, and keeps a save point per open
//! inserted-methods scope. When a scope closes, whatever the inserted methods overwrote is
//! flagged dirty and written back lazily, right before the next write that could depend on it.

mod state;
mod subchannels;
mod table;

pub use state::{DirtyFields, MethodKey, SemStack, SemState, StaleValue};
pub use subchannels::{SubchannelEntry, SubchannelTable};
pub use table::{SemaphoreClassTable, SemaphoreMethod, SemaphoreTables, DEFAULT_HOST_METHOD_LIMIT};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::base::ChannelWrapperBase;
use crate::chain::ChainHead;
use crate::channel::{
    Channel, HeaderKind, ObjectHandle, ReleaseFlags, SemaphorePayloadSize, WriteKind,
};
use crate::error::{ChannelError, ContractViolation, Result};
use crate::guard::ScopedFlag;

pub const DEFAULT_RESTORE_ITERATION_LIMIT: u32 = 8;

/// Where the next backend semaphore operation should be written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupportedClass {
    Subchannel { subchannel: u32, class: u32 },
    /// Use a host semaphore instead.
    Host,
}

pub struct SemaphoreChannelWrapper {
    base: ChannelWrapperBase,
    tables: SemaphoreTables,
    restore_iteration_limit: u32,
    stack: RefCell<SemStack>,
    subchannels: RefCell<SubchannelTable>,
    /// Objects instantiated by [`SemaphoreChannelWrapper::find_supported_class`].
    created: RefCell<Vec<ObjectHandle>>,
    restoring: Cell<bool>,
    restores: Cell<u64>,
}

impl SemaphoreChannelWrapper {
    pub fn new(
        inner: Rc<dyn Channel>,
        tables: SemaphoreTables,
        restore_iteration_limit: u32,
    ) -> Self {
        let num_subchannels = inner.num_subchannels();
        let host_method_limit = tables.host_method_limit;
        Self {
            base: ChannelWrapperBase::new(inner),
            tables,
            restore_iteration_limit,
            stack: RefCell::new(SemStack::new(host_method_limit)),
            subchannels: RefCell::new(SubchannelTable::new(num_subchannels)),
            created: RefCell::new(Vec::new()),
            restoring: Cell::new(false),
            restores: Cell::new(0),
        }
    }

    pub fn is_supported(channel: &dyn Channel) -> bool {
        channel.num_subchannels() > 0
    }

    /// Number of open save points, including the base level.
    pub fn depth(&self) -> usize {
        self.stack.borrow().depth()
    }

    /// Snapshot of the live semaphore state.
    pub fn state(&self) -> SemState {
        self.stack.borrow().top().clone()
    }

    pub fn needs_restore(&self) -> bool {
        self.stack.borrow().top().is_dirty()
    }

    /// How many restore scopes were issued so far.
    pub fn restore_count(&self) -> u64 {
        self.restores.get()
    }

    fn inner(&self) -> &dyn Channel {
        self.base.inner()
    }

    fn entry(&self, subchannel: u32) -> Result<SubchannelEntry> {
        let cached = self.subchannels.borrow().cached(subchannel);
        match cached {
            Some(entry) => Ok(entry),
            None => {
                let entry = subchannels::query_entry(self.inner(), subchannel)?;
                self.subchannels.borrow_mut().store(subchannel, entry);
                Ok(entry)
            }
        }
    }

    fn before_write(&self, subchannel: u32) -> Result<()> {
        self.subchannels.borrow_mut().touch(subchannel);
        if self.restoring.get() {
            return Ok(());
        }
        let stale = {
            let stack = self.stack.borrow();
            let top = stack.top();
            let subchannel_bit = 1u32.checked_shl(subchannel).unwrap_or(0);
            !top.dirty_fields().is_empty()
                || top.host_dirty()
                || top.dirty_subchannels() & subchannel_bit != 0
        };
        if stale {
            self.restore()?;
        }
        Ok(())
    }

    fn observe_write(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        let words: &[u32] = match kind {
            WriteKind::Immediate => &data[..data.len().min(1)],
            _ => data,
        };
        let mut class = None;
        for (index, &word) in words.iter().enumerate() {
            let target = kind.method_for_word(method, index);
            let host = self.tables.is_host_method(target);
            if !host && class.is_none() {
                class = Some(self.entry(subchannel)?.class);
            }
            let Some(entry) = self.tables.lookup(class.flatten(), target) else {
                continue;
            };
            // Host state is per channel, not per subchannel.
            let key_subchannel = if host { 0 } else { subchannel };
            let mut stack = self.stack.borrow_mut();
            if !entry.trigger {
                stack.record_method(key_subchannel, target, word);
            }
            if !entry.invalidates.is_empty() {
                stack.forget_methods(key_subchannel, entry.invalidates.iter().copied());
            }
        }
        Ok(())
    }

    fn observe_header(&self, kind: HeaderKind, subchannel: u32, method: u32, count: u32) {
        // The payload arrives unparsed, so whatever the header covers is unknown from here on.
        let covered: Vec<u32> = match kind {
            HeaderKind::Incrementing => (0..count).map(|i| method.wrapping_add(4 * i)).collect(),
            HeaderKind::NonIncrementing => vec![method],
        };
        let (host, engine): (Vec<u32>, Vec<u32>) = covered
            .into_iter()
            .partition(|&target| self.tables.is_host_method(target));
        let mut stack = self.stack.borrow_mut();
        stack.forget_methods(0, host);
        stack.forget_methods(subchannel, engine);
    }

    /// Write back every dirty value until the live state matches the cached one.
    fn restore(&self) -> Result<()> {
        let _restoring = ScopedFlag::raise(&self.restoring);
        let mut iterations = 0;
        while self.needs_restore() {
            if iterations == self.restore_iteration_limit {
                tracing::error!(iterations, "semaphore state restore did not converge");
                return Err(ContractViolation::RestoreDidNotConverge { iterations }.into());
            }
            iterations += 1;
            self.restores.set(self.restores.get() + 1);

            self.begin_inserted_methods()?;
            if let Err(err) = self.reissue_dirty() {
                if let Err(cancel_err) = self.cancel_inserted_methods() {
                    tracing::warn!(%cancel_err, "failed to close semaphore restore scope");
                }
                return Err(err);
            }
            self.end_inserted_methods()?;
        }
        if iterations > 0 {
            tracing::debug!(iterations, "restored semaphore state");
        }
        Ok(())
    }

    fn reissue_dirty(&self) -> Result<()> {
        let (dirty, stale, target) = {
            let stack = self.stack.borrow();
            let top = stack.top();
            (top.dirty_fields(), top.stale_values(), top.clone())
        };
        tracing::trace!(?dirty, stale = stale.len(), "re-issuing semaphore state");

        let mut current_mask =
            (!dirty.contains(DirtyFields::MASK)).then_some(target.subdevice_mask);
        for value in &stale {
            if current_mask != Some(value.subdevice_mask) {
                self.write_set_subdevice(value.subdevice_mask)?;
                current_mask = Some(value.subdevice_mask);
            }
            self.write_method(
                WriteKind::Incrementing,
                value.subchannel,
                value.method,
                &[value.data],
            )?;
        }
        if current_mask != Some(target.subdevice_mask) {
            self.write_set_subdevice(target.subdevice_mask)?;
        }

        if dirty.contains(DirtyFields::OFFSET) {
            self.set_semaphore_offset(target.sem_offset)?;
        }
        if dirty.contains(DirtyFields::RELEASE_FLAGS) {
            self.set_semaphore_release_flags(target.release_flags)?;
        }
        if dirty.contains(DirtyFields::PAYLOAD_SIZE) {
            self.set_semaphore_payload_size(target.payload_size)?;
        }
        Ok(())
    }

    /// Pick where the next backend semaphore operation for one of `classes` should go.
    ///
    /// Preference order: the class bound on the most recently used subchannel, another
    /// subchannel on the same engine with an acceptable class, the host (when `allow_host`),
    /// then a new object of the first acceptable class the engine supports, bound on an unused
    /// subchannel.
    pub fn find_supported_class(
        &self,
        classes: &[u32],
        allow_host: bool,
    ) -> Result<SupportedClass> {
        let (history, num_subchannels) = {
            let table = self.subchannels.borrow();
            (table.history().to_vec(), table.len())
        };

        let mut engine = None;
        if let Some(&recent) = history.first() {
            let entry = self.entry(recent)?;
            if let Some(class) = entry.class.filter(|class| classes.contains(class)) {
                return Ok(SupportedClass::Subchannel {
                    subchannel: recent,
                    class,
                });
            }
            engine = entry.engine;
        }
        let engine = match engine {
            Some(engine) => Some(engine),
            None => self.inner().engine()?,
        };

        let candidates = history
            .iter()
            .copied()
            .chain((0..num_subchannels).filter(|subchannel| !history.contains(subchannel)));
        let mut unused = None;
        for subchannel in candidates {
            let entry = self.entry(subchannel)?;
            if entry.handle.is_none() {
                unused = unused.or(Some(subchannel));
                continue;
            }
            let same_engine = engine.is_none() || entry.engine == engine;
            let acceptable = entry
                .class
                .filter(|class| same_engine && classes.contains(class));
            if let Some(class) = acceptable {
                return Ok(SupportedClass::Subchannel { subchannel, class });
            }
        }

        if allow_host {
            return Ok(SupportedClass::Host);
        }

        if let (Some(subchannel), Some(engine)) = (unused, engine) {
            let supported = self.inner().supported_classes(engine)?;
            if let Some(&class) = classes.iter().find(|class| supported.contains(*class)) {
                let handle = self.create_object(class)?;
                self.set_object(subchannel, handle)?;
                self.created.borrow_mut().push(handle);
                tracing::debug!(subchannel, class, ?engine, "instantiated semaphore class");
                return Ok(SupportedClass::Subchannel { subchannel, class });
            }
        }

        Err(ChannelError::Unsupported(
            "no subchannel can execute any of the requested semaphore classes",
        ))
    }
}

impl Channel for SemaphoreChannelWrapper {
    fn wrapped(&self) -> Option<&dyn Channel> {
        Some(self.inner())
    }

    fn chain_head(&self) -> Option<ChainHead> {
        self.base.chain_head()
    }

    fn semaphore_wrapper(&self) -> Option<&SemaphoreChannelWrapper> {
        Some(self)
    }

    fn write_method(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        self.before_write(subchannel)?;
        self.observe_write(kind, subchannel, method, data)?;
        self.inner().write_method(kind, subchannel, method, data)
    }

    fn write_header(
        &self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        self.before_write(subchannel)?;
        self.observe_header(kind, subchannel, method, count);
        self.inner().write_header(kind, subchannel, method, count)
    }

    fn write_set_subdevice(&self, mask: u32) -> Result<()> {
        self.stack.borrow_mut().set_subdevice_mask(mask);
        self.inner().write_set_subdevice(mask)
    }

    fn begin_inserted_methods(&self) -> Result<()> {
        self.inner().begin_inserted_methods()?;
        self.stack.borrow_mut().push();
        Ok(())
    }

    fn end_inserted_methods(&self) -> Result<()> {
        self.stack.borrow_mut().pop()?;
        self.inner().end_inserted_methods()
    }

    fn cancel_inserted_methods(&self) -> Result<()> {
        self.stack.borrow_mut().pop()?;
        self.inner().cancel_inserted_methods()
    }

    fn set_semaphore_offset(&self, offset: u64) -> Result<()> {
        self.stack.borrow_mut().set_sem_offset(offset);
        self.inner().set_semaphore_offset(offset)
    }

    fn set_semaphore_release_flags(&self, flags: ReleaseFlags) -> Result<()> {
        self.stack.borrow_mut().set_release_flags(flags);
        self.inner().set_semaphore_release_flags(flags)
    }

    fn set_semaphore_payload_size(&self, size: SemaphorePayloadSize) -> Result<()> {
        self.stack.borrow_mut().set_payload_size(size);
        self.inner().set_semaphore_payload_size(size)
    }

    fn semaphore_acquire(&self, payload: u64) -> Result<()> {
        if !self.restoring.get() && self.needs_restore() {
            self.restore()?;
        }
        self.inner().semaphore_acquire(payload)
    }

    fn semaphore_release(&self, payload: u64) -> Result<()> {
        if !self.restoring.get() && self.needs_restore() {
            self.restore()?;
        }
        self.inner().semaphore_release(payload)
    }

    fn set_object(&self, subchannel: u32, handle: ObjectHandle) -> Result<()> {
        self.inner().set_object(subchannel, handle)?;
        self.subchannels.borrow_mut().invalidate(subchannel);
        Ok(())
    }

    fn unset_object(&self, handle: ObjectHandle) -> Result<()> {
        self.inner().unset_object(handle)?;
        self.subchannels.borrow_mut().invalidate_handle(handle);
        Ok(())
    }

    fn free_object(&self, handle: ObjectHandle) -> Result<()> {
        self.inner().free_object(handle)?;
        self.subchannels.borrow_mut().invalidate_handle(handle);
        self.created.borrow_mut().retain(|&created| created != handle);
        Ok(())
    }

    fn recover_from_robust_error(&self) -> Result<()> {
        self.stack.borrow_mut().reset();
        self.subchannels.borrow_mut().clear();
        self.inner().recover_from_robust_error()
    }
}

impl Drop for SemaphoreChannelWrapper {
    fn drop(&mut self) {
        for handle in self.created.get_mut().drain(..) {
            if let Err(err) = self.base.inner().free_object(handle) {
                tracing::warn!(?handle, %err, "failed to free semaphore object");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EngineId;
    use crate::recording::{RecordingChannel, RecordingChannelConfig, TraceEntry};
    use pretty_assertions::assert_eq;

    const COPY: u32 = 0xC5B5;
    const COMPUTE: u32 = 0xC6C0;
    const COPY_ENGINE: EngineId = EngineId(1);
    const GR_ENGINE: EngineId = EngineId(0);

    fn leaf() -> Rc<RecordingChannel> {
        Rc::new(RecordingChannel::new(RecordingChannelConfig {
            engine: Some(GR_ENGINE),
            classes: vec![(COPY, COPY_ENGINE), (COMPUTE, GR_ENGINE), (0xC797, GR_ENGINE)],
            ..Default::default()
        }))
    }

    fn wrap(leaf: &Rc<RecordingChannel>) -> SemaphoreChannelWrapper {
        SemaphoreChannelWrapper::new(
            leaf.clone(),
            SemaphoreTables::default(),
            DEFAULT_RESTORE_ITERATION_LIMIT,
        )
    }

    fn bind(channel: &dyn Channel, subchannel: u32, class: u32) {
        let handle = channel.create_object(class).unwrap();
        channel.set_object(subchannel, handle).unwrap();
    }

    fn method(subchannel: u32, method: u32, data: u32) -> TraceEntry {
        TraceEntry::Method {
            kind: WriteKind::Incrementing,
            subchannel,
            method,
            data: vec![data],
        }
    }

    #[test]
    fn overwritten_offset_is_restored_before_the_next_write() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        sem.set_semaphore_offset(0x1000).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.set_semaphore_offset(0x2000).unwrap();
        sem.end_inserted_methods().unwrap();
        assert!(sem.needs_restore());
        leaf.take_trace();

        sem.write(0, 0x400, &[1]).unwrap();
        assert_eq!(
            leaf.trace(),
            vec![
                TraceEntry::BeginInsertedMethods,
                TraceEntry::SemaphoreOffset { offset: 0x1000 },
                TraceEntry::EndInsertedMethods,
                method(0, 0x400, 1),
            ]
        );
        assert!(!sem.needs_restore());
        assert_eq!(sem.restore_count(), 1);
    }

    #[test]
    fn untouched_state_needs_no_restore() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        sem.set_semaphore_offset(0x1000).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.write(0, 0x400, &[1]).unwrap();
        sem.end_inserted_methods().unwrap();
        assert!(!sem.needs_restore());
        assert_eq!(sem.depth(), 1);
    }

    #[test]
    fn engine_method_is_restored_only_before_writes_to_its_subchannel() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 2, COPY);
        sem.write(2, 0x240, &[0xAB]).unwrap();

        sem.begin_inserted_methods().unwrap();
        sem.write(2, 0x240, &[0xCD]).unwrap();
        sem.end_inserted_methods().unwrap();
        leaf.take_trace();

        sem.write(1, 0x400, &[1]).unwrap();
        assert_eq!(leaf.take_trace(), vec![method(1, 0x400, 1)]);

        sem.write(2, 0x300, &[1]).unwrap();
        assert_eq!(
            leaf.take_trace(),
            vec![
                TraceEntry::BeginInsertedMethods,
                method(2, 0x240, 0xAB),
                TraceEntry::EndInsertedMethods,
                method(2, 0x300, 1),
            ]
        );
    }

    #[test]
    fn host_method_is_restored_before_any_write() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        sem.write(3, 0x10, &[0x55]).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.write(5, 0x10, &[0x66]).unwrap();
        sem.end_inserted_methods().unwrap();
        leaf.take_trace();

        sem.write(7, 0x400, &[1]).unwrap();
        assert_eq!(
            leaf.trace(),
            vec![
                TraceEntry::BeginInsertedMethods,
                method(0, 0x10, 0x55),
                TraceEntry::EndInsertedMethods,
                method(7, 0x400, 1),
            ]
        );
    }

    #[test]
    fn execute_method_forgets_what_it_invalidates() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 1, COPY);
        sem.write(1, 0x248, &[9]).unwrap();
        sem.write(1, 0x300, &[1]).unwrap();
        assert_eq!(sem.state().value((1, 0x248), 1), None);
        assert_eq!(sem.state().value((1, 0x300), 1), None);
    }

    #[test]
    fn launch_inside_an_inserted_scope_is_never_replayed() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 2, COPY);
        sem.write(2, 0x300, &[1]).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.write(2, 0x300, &[2]).unwrap();
        sem.end_inserted_methods().unwrap();
        assert!(!sem.needs_restore());
        leaf.take_trace();

        sem.write(2, 0x400, &[3]).unwrap();
        assert_eq!(leaf.trace(), vec![method(2, 0x400, 3)]);
        assert_eq!(sem.restore_count(), 0);
    }

    #[test]
    fn incrementing_write_observes_every_word() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 0, COMPUTE);
        sem.write(0, 0x1b00, &[1, 2, 3]).unwrap();
        let state = sem.state();
        assert_eq!(state.value((0, 0x1b00), 1), Some(1));
        assert_eq!(state.value((0, 0x1b04), 1), Some(2));
        assert_eq!(state.value((0, 0x1b08), 1), Some(3));
    }

    #[test]
    fn header_drops_the_methods_it_covers() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 0, COMPUTE);
        sem.write(0, 0x1b00, &[1, 2]).unwrap();
        sem.write_header(HeaderKind::Incrementing, 0, 0x1b04, 2).unwrap();
        let state = sem.state();
        assert_eq!(state.value((0, 0x1b00), 1), Some(1));
        assert_eq!(state.value((0, 0x1b04), 1), None);
    }

    #[test]
    fn restore_switches_subdevice_masks_and_back() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        sem.write_set_subdevice(0x1).unwrap();
        sem.write(0, 0x14, &[0xA]).unwrap();
        sem.write_set_subdevice(0x3).unwrap();

        sem.begin_inserted_methods().unwrap();
        sem.write(0, 0x14, &[0xB]).unwrap();
        sem.end_inserted_methods().unwrap();
        leaf.take_trace();

        sem.semaphore_release(1).unwrap();
        assert_eq!(
            leaf.trace(),
            vec![
                TraceEntry::BeginInsertedMethods,
                TraceEntry::SetSubdevice { mask: 0x1 },
                method(0, 0x14, 0xA),
                TraceEntry::SetSubdevice { mask: 0x3 },
                TraceEntry::EndInsertedMethods,
                TraceEntry::SemaphoreRelease { payload: 1 },
            ]
        );
    }

    #[test]
    fn unmatched_end_underflows_the_state_stack() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        assert_eq!(
            sem.end_inserted_methods(),
            Err(ContractViolation::SemaphoreStackUnderflow.into())
        );
        assert!(leaf.trace().is_empty());
    }

    #[test]
    fn prefers_the_most_recently_used_subchannel() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 0, COMPUTE);
        bind(&sem, 4, COMPUTE);
        sem.write(4, 0x400, &[1]).unwrap();
        assert_eq!(
            sem.find_supported_class(&[COMPUTE], false).unwrap(),
            SupportedClass::Subchannel {
                subchannel: 4,
                class: COMPUTE
            }
        );
    }

    #[test]
    fn falls_back_to_another_subchannel_on_the_same_engine() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 0, 0xC797);
        bind(&sem, 5, COMPUTE);
        sem.write(0, 0x400, &[1]).unwrap();
        assert_eq!(
            sem.find_supported_class(&[COMPUTE], true).unwrap(),
            SupportedClass::Subchannel {
                subchannel: 5,
                class: COMPUTE
            }
        );
    }

    #[test]
    fn host_fallback_comes_before_instantiation() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        assert_eq!(
            sem.find_supported_class(&[COMPUTE], true).unwrap(),
            SupportedClass::Host
        );
    }

    #[test]
    fn instantiates_on_an_unused_subchannel_and_frees_on_drop() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        bind(&sem, 0, 0xC797);
        sem.write(0, 0x400, &[1]).unwrap();

        let found = sem.find_supported_class(&[COPY, COMPUTE], false).unwrap();
        assert_eq!(
            found,
            SupportedClass::Subchannel {
                subchannel: 1,
                class: COMPUTE
            }
        );
        assert_eq!(leaf.object_class(1).unwrap(), Some(COMPUTE));

        drop(sem);
        assert_eq!(leaf.object_class(1).unwrap(), None);
        assert!(matches!(
            leaf.trace().last(),
            Some(TraceEntry::FreeObject { .. })
        ));
    }

    #[test]
    fn reports_unsupported_when_nothing_fits() {
        let leaf = Rc::new(RecordingChannel::new(RecordingChannelConfig {
            num_subchannels: 1,
            engine: Some(GR_ENGINE),
            classes: vec![(0xC797, GR_ENGINE)],
            ..Default::default()
        }));
        let sem = wrap(&leaf);
        bind(&sem, 0, 0xC797);
        assert!(matches!(
            sem.find_supported_class(&[COMPUTE], false),
            Err(ChannelError::Unsupported(_))
        ));
    }

    /// Inserts a semaphore offset change from the top of the chain every time a scope closes.
    struct PerturbOnEnd {
        base: ChannelWrapperBase,
        busy: Cell<bool>,
    }

    impl Channel for PerturbOnEnd {
        fn wrapped(&self) -> Option<&dyn Channel> {
            Some(self.base.inner())
        }

        fn chain_head(&self) -> Option<ChainHead> {
            self.base.chain_head()
        }

        fn end_inserted_methods(&self) -> Result<()> {
            self.base.inner().end_inserted_methods()?;
            if self.busy.get() {
                return Ok(());
            }
            let _busy = ScopedFlag::raise(&self.busy);
            let top = self.base.outermost();
            top.begin_inserted_methods()?;
            top.set_semaphore_offset(0xBAD)?;
            top.end_inserted_methods()
        }
    }

    #[test]
    fn restore_that_never_settles_is_a_contract_violation() {
        let leaf = leaf();
        let perturb: Rc<dyn Channel> = Rc::new(PerturbOnEnd {
            base: ChannelWrapperBase::new(leaf.clone()),
            busy: Cell::new(false),
        });
        let sem: Rc<dyn Channel> = Rc::new(SemaphoreChannelWrapper::new(
            perturb,
            SemaphoreTables::default(),
            3,
        ));
        leaf.chain_head().unwrap().set_outermost(&sem);

        sem.set_semaphore_offset(0x1000).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.end_inserted_methods().unwrap();
        assert!(sem.semaphore_wrapper().unwrap().needs_restore());

        assert_eq!(
            sem.write(0, 0x400, &[1]),
            Err(ContractViolation::RestoreDidNotConverge { iterations: 3 }.into())
        );
    }

    #[test]
    fn robust_recovery_forgets_everything() {
        let leaf = leaf();
        let sem = wrap(&leaf);
        sem.set_semaphore_offset(0x1000).unwrap();
        sem.begin_inserted_methods().unwrap();
        sem.set_semaphore_offset(0x2000).unwrap();
        sem.recover_from_robust_error().unwrap();
        assert_eq!(sem.depth(), 1);
        assert!(!sem.needs_restore());
    }
}
