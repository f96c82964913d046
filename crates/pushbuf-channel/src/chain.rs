use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::channel::Channel;

/// Non-owning reference to the outermost layer of a channel chain.
///
/// One head is shared by every layer of a chain. Pushing a new outer layer updates it once via
/// [`ChainHead::set_outermost`]; layers (and leaf channels that need to re-enter the chain from
/// the top) look the outermost layer up through it. The head never keeps a layer alive.
#[derive(Clone, Default)]
pub struct ChainHead {
    outermost: Rc<RefCell<Option<Weak<dyn Channel>>>>,
}

impl ChainHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outermost(&self, channel: &Rc<dyn Channel>) {
        *self.outermost.borrow_mut() = Some(Rc::downgrade(channel));
    }

    /// The outermost layer, or `None` if none was registered or it has been dropped.
    pub fn outermost(&self) -> Option<Rc<dyn Channel>> {
        self.outermost.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn same_chain(&self, other: &ChainHead) -> bool {
        Rc::ptr_eq(&self.outermost, &other.outermost)
    }
}

impl fmt::Debug for ChainHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHead")
            .field("attached", &self.outermost().is_some())
            .finish()
    }
}
