//! Atomic-sequence buffering.
//!
//! [`AtomChannelWrapper`] guarantees that a method sequence the [`AtomClassifier`] identifies as
//! an atom reaches the wrapped channel as one contiguous block, even when inserted methods
//! (scheduling bookkeeping, semaphore restores, ...) arrive while the atom is still open.
//!
//! Every arrival is queued on `incoming` and processed by a single drain loop. Operations that
//! re-enter the wrapper while the loop is running (for example from a flush triggered by the
//! leaf in the middle of an atom replay) are appended to the same queue, so they can never land
//! inside a replayed atom and keep their order relative to one another. Flushes and wait-idles
//! that arrive this way are queued too: a flush never publishes half of an atom, and neither
//! overtakes methods queued before it.

mod op;

pub use op::{ChannelOp, OpKind};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use crate::base::ChannelWrapperBase;
use crate::chain::ChainHead;
use crate::channel::{Channel, HeaderKind, WriteKind};
use crate::classify::{AtomClassifier, AtomPhase};
use crate::error::{ContractViolation, Result};
use crate::guard::ScopedFlag;
use crate::runlist::RunlistChannelWrapper;

/// Counters describing how the wrapper handled the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AtomStats {
    pub ops_passed_through: u64,
    pub ops_deferred: u64,
    pub atoms_replayed: u64,
    pub raw_blocks_emitted: u64,
    pub gp_entries_closed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Decision {
    flush_before: bool,
    enqueue: bool,
    flush_after: bool,
}

impl Decision {
    const PASS: Self = Self {
        flush_before: false,
        enqueue: false,
        flush_after: false,
    };

    fn for_write(phase: AtomPhase) -> Self {
        match phase {
            AtomPhase::NotInAtom => Self {
                flush_before: true,
                ..Self::PASS
            },
            AtomPhase::InNewAtom => Self {
                flush_before: true,
                enqueue: true,
                flush_after: false,
            },
            AtomPhase::InAtom => Self {
                enqueue: true,
                ..Self::PASS
            },
            AtomPhase::AtomEndsAfter => Self {
                flush_before: false,
                enqueue: true,
                flush_after: true,
            },
        }
    }
}

pub struct AtomChannelWrapper {
    base: ChannelWrapperBase,
    classifier: RefCell<Box<dyn AtomClassifier>>,
    incoming: RefCell<VecDeque<ChannelOp>>,
    atom_ops: RefCell<VecDeque<ChannelOp>>,
    inserted_depth: Cell<u32>,
    draining: Cell<bool>,
    executing_atom: Cell<bool>,
    /// Lets the next flush reaching this layer through to the wrapped channel.
    forward_flush: Cell<bool>,
    stats: Cell<AtomStats>,
}

impl AtomChannelWrapper {
    pub fn new(inner: Rc<dyn Channel>, classifier: Box<dyn AtomClassifier>) -> Self {
        Self {
            base: ChannelWrapperBase::new(inner),
            classifier: RefCell::new(classifier),
            incoming: RefCell::new(VecDeque::new()),
            atom_ops: RefCell::new(VecDeque::new()),
            inserted_depth: Cell::new(0),
            draining: Cell::new(false),
            executing_atom: Cell::new(false),
            forward_flush: Cell::new(false),
            stats: Cell::new(AtomStats::default()),
        }
    }

    /// Atom replay needs the wrapped channel to format methods into an external buffer.
    pub fn is_supported(channel: &dyn Channel) -> bool {
        let mut scratch = Vec::new();
        channel.num_subchannels() > 0
            && channel
                .format_method(&mut scratch, WriteKind::Incrementing, 0, 0, &[])
                .is_ok()
    }

    /// Number of operations buffered in the open atom.
    pub fn pending_atom_len(&self) -> usize {
        self.atom_ops.borrow().len()
    }

    pub fn inserted_depth(&self) -> u32 {
        self.inserted_depth.get()
    }

    /// True while a buffered atom is being written to the wrapped channel.
    pub fn is_executing_atom(&self) -> bool {
        self.executing_atom.get()
    }

    pub fn stats(&self) -> AtomStats {
        self.stats.get()
    }

    fn inner(&self) -> &dyn Channel {
        self.base.inner()
    }

    fn bump(&self, update: impl FnOnce(&mut AtomStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn submit(&self, op: ChannelOp) -> Result<()> {
        self.incoming.borrow_mut().push_back(op);
        self.drain_incoming()
    }

    /// Queue a flush behind everything already waiting. Back-to-back flushes collapse into one.
    fn defer_flush(&self, through_chain: bool) {
        let mut incoming = self.incoming.borrow_mut();
        if let Some(ChannelOp {
            kind: OpKind::Flush {
                through_chain: queued,
            },
            ..
        }) = incoming.back_mut()
        {
            *queued |= through_chain;
            return;
        }
        incoming.push_back(ChannelOp::flush(through_chain));
    }

    fn scheduler_notifying(&self) -> bool {
        let outermost = self.base.outermost();
        outermost
            .runlist_wrapper()
            .is_some_and(RunlistChannelWrapper::is_notifying)
    }

    fn drain_incoming(&self) -> Result<()> {
        if self.draining.get() {
            // The active loop further up the stack picks this op up.
            tracing::trace!("atom wrapper re-entered; op queued for the active drain loop");
            return Ok(());
        }
        let _draining = ScopedFlag::raise(&self.draining);

        loop {
            let Some(op) = self.incoming.borrow_mut().pop_front() else {
                return Ok(());
            };
            self.process_op(op)?;
        }
    }

    fn process_op(&self, op: ChannelOp) -> Result<()> {
        match op.kind {
            kind if kind.is_scope_marker() => return self.process_scope_marker(kind),
            OpKind::Flush { through_chain } => return self.process_flush(through_chain),
            OpKind::WaitIdle => return self.process_wait_idle(),
            _ => {}
        }

        if self.inserted_depth.get() > 0 {
            // No atomic method is ever issued between begin/end inserted methods.
            return self.pass_through(&op);
        }

        match op.kind {
            OpKind::Write(kind) => {
                let phase = self.classifier.borrow_mut().classify_write(
                    kind,
                    op.subchannel,
                    op.method,
                    &op.data,
                );
                self.apply(op, Decision::for_write(phase), phase)
            }
            OpKind::Header(kind) => {
                let phase = self.classifier.borrow_mut().classify_header(
                    kind,
                    op.subchannel,
                    op.method,
                    op.count,
                );
                let decision = match phase {
                    AtomPhase::InNewAtom => Decision {
                        flush_before: true,
                        enqueue: true,
                        flush_after: false,
                    },
                    AtomPhase::InAtom => Decision {
                        enqueue: true,
                        ..Decision::PASS
                    },
                    other => {
                        tracing::error!(
                            phase = ?other,
                            subchannel = op.subchannel,
                            method = op.method,
                            "method header classified outside an atom"
                        );
                        return Err(ContractViolation::IllegalHeaderPhase(other).into());
                    }
                };
                self.apply(op, decision, phase)
            }
            OpKind::Nop
            | OpKind::SetSubdevice
            | OpKind::CancelAtom
            | OpKind::SemaphoreAcquire
            | OpKind::SemaphoreRelease => {
                self.classifier.borrow_mut().cancel_atom();
                self.write_queue()?;
                self.pass_through(&op)
            }
            OpKind::CallSubroutine | OpKind::InsertSubroutine => {
                let mid_atom = self.classifier.borrow().in_atom() && self.pending_atom_len() > 0;
                let decision = if mid_atom {
                    Decision {
                        enqueue: true,
                        ..Decision::PASS
                    }
                } else {
                    Decision {
                        flush_before: true,
                        ..Decision::PASS
                    }
                };
                self.apply(op, decision, AtomPhase::InAtom)
            }
            OpKind::SetPrivEnable | OpKind::SetSyncEnable => {
                // Keep these in order relative to an open atom, but never start or end one.
                let decision = Decision {
                    enqueue: self.pending_atom_len() > 0,
                    ..Decision::PASS
                };
                self.apply(op, decision, AtomPhase::InAtom)
            }
            OpKind::BeginInsertedMethods
            | OpKind::EndInsertedMethods
            | OpKind::CancelInsertedMethods => self.process_scope_marker(op.kind),
            OpKind::Flush { through_chain } => self.process_flush(through_chain),
            OpKind::WaitIdle => self.process_wait_idle(),
        }
    }

    fn process_flush(&self, through_chain: bool) -> Result<()> {
        if !through_chain {
            return self.inner().flush();
        }
        let _forward = ScopedFlag::raise(&self.forward_flush);
        self.base.outermost().flush()
    }

    /// Wait-idle never leaves an atom dangling, inside an inserted scope or not.
    fn process_wait_idle(&self) -> Result<()> {
        self.classifier.borrow_mut().cancel_atom();
        self.write_queue()?;
        self.inner().wait_idle()
    }

    fn apply(&self, op: ChannelOp, decision: Decision, phase: AtomPhase) -> Result<()> {
        tracing::trace!(
            kind = ?op.kind,
            subchannel = op.subchannel,
            method = op.method,
            ?phase,
            flush_before = decision.flush_before,
            enqueue = decision.enqueue,
            flush_after = decision.flush_after,
            "atom decision"
        );

        if decision.flush_before {
            self.write_queue()?;
        }
        if decision.enqueue {
            self.atom_ops.borrow_mut().push_back(op);
            self.bump(|s| s.ops_deferred += 1);
        } else {
            self.pass_through(&op)?;
        }
        if decision.flush_after {
            self.write_queue()?;
        }
        Ok(())
    }

    fn pass_through(&self, op: &ChannelOp) -> Result<()> {
        self.bump(|s| s.ops_passed_through += 1);
        op.execute(self.inner())
    }

    fn process_scope_marker(&self, kind: OpKind) -> Result<()> {
        let depth = self.inserted_depth.get();
        match kind {
            OpKind::BeginInsertedMethods => {
                self.inner().begin_inserted_methods()?;
                self.inserted_depth.set(depth + 1);
            }
            OpKind::EndInsertedMethods => {
                if depth == 0 {
                    tracing::error!("end_inserted_methods without begin");
                    return Err(ContractViolation::UnbalancedEndInsertedMethods.into());
                }
                self.inner().end_inserted_methods()?;
                self.inserted_depth.set(depth - 1);
            }
            OpKind::CancelInsertedMethods => {
                if depth == 0 {
                    tracing::error!("cancel_inserted_methods without begin");
                    return Err(ContractViolation::CancelWithoutInsertedMethods.into());
                }
                self.inner().cancel_inserted_methods()?;
                self.inserted_depth.set(depth - 1);
            }
            _ => {}
        }
        Ok(())
    }

    /// Replay the buffered atom as consolidated raw blocks.
    fn write_queue(&self) -> Result<()> {
        let ops: Vec<ChannelOp> = self.atom_ops.borrow_mut().drain(..).collect();
        if ops.is_empty() {
            return Ok(());
        }

        let _executing = ScopedFlag::raise(&self.executing_atom);
        let inner = self.inner();
        let gp_put_before = inner.gp_put()?;

        let mut block = Vec::new();
        let mut blocks = 0u64;
        for op in ops {
            if op.kind.is_raw_blockable() {
                op.format_into(inner, &mut block)?;
            } else {
                blocks += self.emit_block(&mut block)?;
                op.execute(inner)?;
            }
        }
        blocks += self.emit_block(&mut block)?;

        let gp_put_after = inner.gp_put()?;
        let closed = gp_put_after != gp_put_before;
        if closed {
            // The atom straddles GP entries; close the open one so a pointer update cannot
            // publish a partial atom.
            inner.finish_open_gp_entry()?;
        }

        tracing::debug!(blocks, gp_put_before, gp_put_after, "replayed atom");
        self.bump(|s| {
            s.atoms_replayed += 1;
            s.raw_blocks_emitted += blocks;
            s.gp_entries_closed += u64::from(closed);
        });
        Ok(())
    }

    fn emit_block(&self, block: &mut Vec<u32>) -> Result<u64> {
        if block.is_empty() {
            return Ok(0);
        }
        self.inner().insert_subroutine(block)?;
        block.clear();
        Ok(1)
    }
}

impl Channel for AtomChannelWrapper {
    fn wrapped(&self) -> Option<&dyn Channel> {
        Some(self.inner())
    }

    fn chain_head(&self) -> Option<ChainHead> {
        self.base.chain_head()
    }

    fn atom_wrapper(&self) -> Option<&AtomChannelWrapper> {
        Some(self)
    }

    fn write_method(
        &self,
        kind: WriteKind,
        subchannel: u32,
        method: u32,
        data: &[u32],
    ) -> Result<()> {
        self.submit(ChannelOp::write(kind, subchannel, method, data))
    }

    fn write_header(
        &self,
        kind: HeaderKind,
        subchannel: u32,
        method: u32,
        count: u32,
    ) -> Result<()> {
        self.submit(ChannelOp::header(kind, subchannel, method, count))
    }

    fn write_nop(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::Nop))
    }

    fn write_set_subdevice(&self, mask: u32) -> Result<()> {
        self.submit(ChannelOp::set_subdevice(mask))
    }

    fn call_subroutine(&self, offset: u64, size: u32) -> Result<()> {
        self.submit(ChannelOp::call_subroutine(offset, size))
    }

    fn insert_subroutine(&self, words: &[u32]) -> Result<()> {
        self.submit(ChannelOp::insert_subroutine(words))
    }

    fn set_priv_enable(&self, enable: bool) -> Result<()> {
        self.submit(ChannelOp::set_priv_enable(enable))
    }

    fn set_sync_enable(&self, enable: bool) -> Result<()> {
        self.submit(ChannelOp::set_sync_enable(enable))
    }

    fn cancel_atom(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::CancelAtom))
    }

    fn begin_inserted_methods(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::BeginInsertedMethods))
    }

    fn end_inserted_methods(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::EndInsertedMethods))
    }

    fn cancel_inserted_methods(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::CancelInsertedMethods))
    }

    fn semaphore_acquire(&self, payload: u64) -> Result<()> {
        self.submit(ChannelOp::semaphore(OpKind::SemaphoreAcquire, payload))
    }

    fn semaphore_release(&self, payload: u64) -> Result<()> {
        self.submit(ChannelOp::semaphore(OpKind::SemaphoreRelease, payload))
    }

    fn flush(&self) -> Result<()> {
        if self.forward_flush.replace(false) || !self.draining.get() {
            return self.inner().flush();
        }
        // Flushes issued from the scheduler callback stay below the runlist layer.
        let through_chain = !self.scheduler_notifying();
        tracing::trace!(
            executing_atom = self.executing_atom.get(),
            through_chain,
            "flush queued for the active drain loop"
        );
        self.defer_flush(through_chain);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.submit(ChannelOp::simple(OpKind::WaitIdle))
    }

    fn recover_from_robust_error(&self) -> Result<()> {
        let dropped = self.incoming.borrow().len() + self.atom_ops.borrow().len();
        if dropped > 0 {
            tracing::warn!(dropped, "discarding buffered ops during robust-channel recovery");
        }
        self.incoming.borrow_mut().clear();
        self.atom_ops.borrow_mut().clear();
        self.inserted_depth.set(0);
        self.classifier.borrow_mut().reset();
        self.inner().recover_from_robust_error()
    }
}
