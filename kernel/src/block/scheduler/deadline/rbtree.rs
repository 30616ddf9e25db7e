//! Red-black tree over a fixed node arena.
//!
//! Node 0 is the black NIL sentinel shared by every leaf and by the root's
//! parent. Links are arena indices, and deletion relinks nodes rather than
//! copying payloads, so an index handed out by [`RbTree::insert`] names the
//! same request until that node is deleted.

use super::FreeSlots;
use crate::block::Request;
use crate::block::scheduler::SchedError;

/// Sentinel index
pub const NIL: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    key: u32,
    color: Color,
    left: usize,
    right: usize,
    parent: usize,
    request: Option<Request>,
    /// Paired arrival-ring entry
    section: usize,
}

impl Node {
    const NIL: Node = Node {
        key: 0,
        color: Color::Black,
        left: NIL,
        right: NIL,
        parent: NIL,
        request: None,
        section: 0,
    };
}

/// Requests ordered by block address.
pub struct RbTree<const SLOTS: usize> {
    nodes: [Node; SLOTS],
    root: usize,
    free: FreeSlots<SLOTS>,
    size: usize,
}

impl<const SLOTS: usize> RbTree<SLOTS> {
    /// Requests the tree can hold
    pub const CAPACITY: usize = SLOTS - 1;

    pub const fn new() -> Self {
        Self {
            nodes: [Node::NIL; SLOTS],
            root: NIL,
            free: FreeSlots::new(),
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Request stored at `node`.
    pub fn request(&self, node: usize) -> Option<Request> {
        self.nodes[node].request
    }

    /// Arrival-ring entry linked to `node`.
    pub fn section(&self, node: usize) -> usize {
        self.nodes[node].section
    }

    pub fn set_section(&mut self, node: usize, section: usize) {
        self.nodes[node].section = section;
    }

    /// Index of the smallest key, if any.
    pub fn min(&self) -> Option<usize> {
        if self.root == NIL {
            None
        } else {
            Some(self.minimum(self.root))
        }
    }

    fn minimum(&self, mut x: usize) -> usize {
        while self.nodes[x].left != NIL {
            x = self.nodes[x].left;
        }
        x
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.nodes[x].right;
        self.nodes[x].right = self.nodes[y].left;
        if self.nodes[y].left != NIL {
            let yl = self.nodes[y].left;
            self.nodes[yl].parent = x;
        }
        self.replace_child(x, y);
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.nodes[x].left;
        self.nodes[x].left = self.nodes[y].right;
        if self.nodes[y].right != NIL {
            let yr = self.nodes[y].right;
            self.nodes[yr].parent = x;
        }
        self.replace_child(x, y);
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }

    /// Puts `v` where `u` hangs off its parent. `v` may be NIL.
    fn replace_child(&mut self, u: usize, v: usize) {
        let p = self.nodes[u].parent;
        if p == NIL {
            self.root = v;
        } else if self.nodes[p].left == u {
            self.nodes[p].left = v;
        } else {
            self.nodes[p].right = v;
        }
        self.nodes[v].parent = p;
    }

    /// Inserts a request keyed by its block address and returns its node.
    /// Equal keys go to the right of existing ones.
    pub fn insert(&mut self, request: Request) -> Result<usize, SchedError> {
        let z = self.free.take().ok_or(SchedError::QueueFull)?;
        let key = request.blockno;

        let mut y = NIL;
        let mut x = self.root;
        while x != NIL {
            y = x;
            x = if key < self.nodes[x].key {
                self.nodes[x].left
            } else {
                self.nodes[x].right
            };
        }

        self.nodes[z] = Node {
            key,
            color: Color::Red,
            left: NIL,
            right: NIL,
            parent: y,
            request: Some(request),
            section: 0,
        };
        if y == NIL {
            self.root = z;
        } else if key < self.nodes[y].key {
            self.nodes[y].left = z;
        } else {
            self.nodes[y].right = z;
        }

        self.insert_fixup(z);
        self.size += 1;
        Ok(z)
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while self.nodes[self.nodes[z].parent].color == Color::Red {
            let p = self.nodes[z].parent;
            let g = self.nodes[p].parent;
            if p == self.nodes[g].left {
                let uncle = self.nodes[g].right;
                if self.nodes[uncle].color == Color::Red {
                    self.nodes[p].color = Color::Black;
                    self.nodes[uncle].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                } else {
                    if z == self.nodes[p].right {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.nodes[z].parent;
                    let g = self.nodes[p].parent;
                    self.nodes[p].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.nodes[g].left;
                if self.nodes[uncle].color == Color::Red {
                    self.nodes[p].color = Color::Black;
                    self.nodes[uncle].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    z = g;
                } else {
                    if z == self.nodes[p].left {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.nodes[z].parent;
                    let g = self.nodes[p].parent;
                    self.nodes[p].color = Color::Black;
                    self.nodes[g].color = Color::Red;
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.nodes[root].color = Color::Black;
    }

    /// Unlinks `z` and frees its slot, returning its request.
    pub fn delete(&mut self, z: usize) -> Option<Request> {
        if z == NIL || z >= SLOTS || self.nodes[z].request.is_none() {
            return None;
        }

        let mut removed_color = self.nodes[z].color;
        let x;
        if self.nodes[z].left == NIL {
            x = self.nodes[z].right;
            self.replace_child(z, x);
        } else if self.nodes[z].right == NIL {
            x = self.nodes[z].left;
            self.replace_child(z, x);
        } else {
            // Splice out the successor and move it into z's place.
            let y = self.minimum(self.nodes[z].right);
            removed_color = self.nodes[y].color;
            x = self.nodes[y].right;
            if self.nodes[y].parent == z {
                self.nodes[x].parent = y;
            } else {
                self.replace_child(y, x);
                self.nodes[y].right = self.nodes[z].right;
                let yr = self.nodes[y].right;
                self.nodes[yr].parent = y;
            }
            self.replace_child(z, y);
            self.nodes[y].left = self.nodes[z].left;
            let yl = self.nodes[y].left;
            self.nodes[yl].parent = y;
            self.nodes[y].color = self.nodes[z].color;
        }

        if removed_color == Color::Black {
            self.delete_fixup(x);
        }

        let request = self.nodes[z].request;
        self.nodes[z] = Node::NIL;
        self.nodes[NIL] = Node::NIL;
        self.free.put(z);
        self.size -= 1;
        request
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && self.nodes[x].color == Color::Black {
            let p = self.nodes[x].parent;
            if x == self.nodes[p].left {
                let mut w = self.nodes[p].right;
                if self.nodes[w].color == Color::Red {
                    self.nodes[w].color = Color::Black;
                    self.nodes[p].color = Color::Red;
                    self.rotate_left(p);
                    w = self.nodes[p].right;
                }
                let wl = self.nodes[w].left;
                let wr = self.nodes[w].right;
                if self.nodes[wl].color == Color::Black && self.nodes[wr].color == Color::Black {
                    self.nodes[w].color = Color::Red;
                    x = p;
                } else {
                    if self.nodes[wr].color == Color::Black {
                        self.nodes[wl].color = Color::Black;
                        self.nodes[w].color = Color::Red;
                        self.rotate_right(w);
                        w = self.nodes[p].right;
                    }
                    self.nodes[w].color = self.nodes[p].color;
                    self.nodes[p].color = Color::Black;
                    let wr = self.nodes[w].right;
                    self.nodes[wr].color = Color::Black;
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[p].left;
                if self.nodes[w].color == Color::Red {
                    self.nodes[w].color = Color::Black;
                    self.nodes[p].color = Color::Red;
                    self.rotate_right(p);
                    w = self.nodes[p].left;
                }
                let wl = self.nodes[w].left;
                let wr = self.nodes[w].right;
                if self.nodes[wl].color == Color::Black && self.nodes[wr].color == Color::Black {
                    self.nodes[w].color = Color::Red;
                    x = p;
                } else {
                    if self.nodes[wl].color == Color::Black {
                        self.nodes[wr].color = Color::Black;
                        self.nodes[w].color = Color::Red;
                        self.rotate_left(w);
                        w = self.nodes[p].left;
                    }
                    self.nodes[w].color = self.nodes[p].color;
                    self.nodes[p].color = Color::Black;
                    let wl = self.nodes[w].left;
                    self.nodes[wl].color = Color::Black;
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.nodes[x].color = Color::Black;
    }

    /// Keys in order.
    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<u32> {
        fn walk<const S: usize>(tree: &RbTree<S>, x: usize, out: &mut Vec<u32>) {
            if x != NIL {
                walk(tree, tree.nodes[x].left, out);
                out.push(tree.nodes[x].key);
                walk(tree, tree.nodes[x].right, out);
            }
        }
        let mut out = Vec::new();
        walk(self, self.root, &mut out);
        out
    }

    /// Verifies coloring, parent links and black height; returns the black
    /// height.
    #[cfg(test)]
    pub(crate) fn check(&self) -> usize {
        fn black_height<const S: usize>(tree: &RbTree<S>, x: usize) -> usize {
            if x == NIL {
                return 1;
            }
            let node = &tree.nodes[x];
            for child in [node.left, node.right] {
                if child != NIL {
                    assert_eq!(tree.nodes[child].parent, x, "broken parent link");
                    assert!(
                        !(node.color == Color::Red && tree.nodes[child].color == Color::Red),
                        "red node {} has a red child",
                        x
                    );
                }
            }
            let left = black_height(tree, node.left);
            let right = black_height(tree, node.right);
            assert_eq!(left, right, "unequal black height below {}", x);
            left + usize::from(node.color == Color::Black)
        }

        assert_eq!(self.nodes[NIL].color, Color::Black);
        if self.root != NIL {
            assert_eq!(self.nodes[self.root].color, Color::Black);
            assert_eq!(self.nodes[self.root].parent, NIL);
        }
        let keys = self.keys();
        assert_eq!(keys.len(), self.size);
        assert!(keys.windows(2).all(|w| w[0] <= w[1]), "keys out of order");
        black_height(self, self.root)
    }
}
