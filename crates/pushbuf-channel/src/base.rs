use std::rc::Rc;

use crate::chain::ChainHead;
use crate::channel::Channel;

/// Transparent forwarding layer.
///
/// Owns the wrapped channel and the chain head shared with it. Every [`Channel`] operation it
/// does not override falls through the trait's default forwarding, so a bare
/// `ChannelWrapperBase` is observably identical to the channel it wraps. Concrete wrappers embed
/// one and forward [`Channel::wrapped`] / [`Channel::chain_head`] to it.
pub struct ChannelWrapperBase {
    inner: Rc<dyn Channel>,
    head: ChainHead,
}

impl ChannelWrapperBase {
    /// Wrap `inner`, joining its chain (or starting one if it has none).
    pub fn new(inner: Rc<dyn Channel>) -> Self {
        let head = inner.chain_head().unwrap_or_default();
        Self { inner, head }
    }

    pub fn inner(&self) -> &dyn Channel {
        &*self.inner
    }

    pub fn head(&self) -> &ChainHead {
        &self.head
    }

    /// The outermost layer of this chain, falling back to the wrapped channel when no outermost
    /// layer has been registered yet.
    pub fn outermost(&self) -> Rc<dyn Channel> {
        self.head
            .outermost()
            .unwrap_or_else(|| Rc::clone(&self.inner))
    }
}

impl Channel for ChannelWrapperBase {
    fn wrapped(&self) -> Option<&dyn Channel> {
        Some(self.inner())
    }

    fn chain_head(&self) -> Option<ChainHead> {
        Some(self.head.clone())
    }
}

impl std::fmt::Debug for ChannelWrapperBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWrapperBase")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingChannel, TraceEntry};

    #[test]
    fn forwards_every_operation_unchanged() {
        let leaf = Rc::new(RecordingChannel::default());
        let base = ChannelWrapperBase::new(leaf.clone());

        base.write(1, 0x100, &[1, 2]).unwrap();
        base.write_nop().unwrap();
        base.begin_inserted_methods().unwrap();
        base.end_inserted_methods().unwrap();
        base.flush().unwrap();
        assert_eq!(base.put().unwrap(), leaf.put().unwrap());
        assert_eq!(base.num_subchannels(), 8);

        assert_eq!(
            leaf.trace(),
            vec![
                TraceEntry::Method {
                    kind: crate::WriteKind::Incrementing,
                    subchannel: 1,
                    method: 0x100,
                    data: vec![1, 2],
                },
                TraceEntry::Nop,
                TraceEntry::BeginInsertedMethods,
                TraceEntry::EndInsertedMethods,
                TraceEntry::Flush,
            ]
        );
    }

    #[test]
    fn passes_failures_through() {
        let leaf = Rc::new(RecordingChannel::default());
        let base = ChannelWrapperBase::new(leaf.clone());
        leaf.inject_robust_error("xid 31");
        assert_eq!(
            base.write_nop(),
            Err(crate::ChannelError::RobustChannel("xid 31".into()))
        );
    }

    #[test]
    fn joins_the_leaf_chain_and_tracks_the_outermost_layer() {
        let leaf = Rc::new(RecordingChannel::default());
        let inner: Rc<dyn Channel> = Rc::new(ChannelWrapperBase::new(leaf.clone()));
        let outer: Rc<dyn Channel> = Rc::new(ChannelWrapperBase::new(inner.clone()));

        let head = leaf.chain_head().unwrap();
        assert!(head.same_chain(&outer.chain_head().unwrap()));
        assert!(head.outermost().is_none());

        head.set_outermost(&outer);
        let found = head.outermost().unwrap();
        assert!(Rc::ptr_eq(&found, &outer));

        // The head never keeps layers alive.
        drop(found);
        drop(outer);
        assert!(head.outermost().is_none());
    }

    #[test]
    fn capability_queries_are_none_without_concrete_layers() {
        let base = ChannelWrapperBase::new(Rc::new(RecordingChannel::default()));
        assert!(base.atom_wrapper().is_none());
        assert!(base.semaphore_wrapper().is_none());
        assert!(base.runlist_wrapper().is_none());
    }
}
