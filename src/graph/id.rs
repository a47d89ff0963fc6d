use std::fmt;

/// A strong type identifying a node in a [`Graph`](super::Graph) arena.
///
/// Node identity is what the encoder deduplicates on: two `Value::Node`s with
/// the same `NodeId` are the same object, and the second occurrence is written
/// as a back-reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Only the arena hands out ids.
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    /// The arena slot.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
