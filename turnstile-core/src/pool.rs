use parking_lot::Mutex;

use crate::ratelimit::Node;

/// Bounded freelist of rate-limit nodes, shared by all tables. Boxes are
/// recycled instead of returned to the allocator; once `capacity` nodes
/// are live, allocation fails until one comes back.
pub(crate) struct Pool {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    free: Vec<Box<Node>>,
    live: usize,
}

impl Pool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                live: 0,
            }),
            capacity,
        }
    }

    pub(crate) fn alloc(&self, init: Node) -> Option<Box<Node>> {
        let mut inner = self.inner.lock();
        if inner.live >= self.capacity {
            return None;
        }
        inner.live += 1;
        Some(match inner.free.pop() {
            Some(mut node) => {
                *node = init;
                node
            }
            None => Box::new(init),
        })
    }

    pub(crate) fn recycle(&self, mut node: Box<Node>) {
        node.next = None;
        let mut inner = self.inner.lock();
        inner.live -= 1;
        inner.free.push(node);
    }
}
