//! Slab-backed doubly-linked list in access order.
//!
//! Nodes live in a `Vec` and link to each other by index, so a node's slot
//! index is a stable handle that a map can hold. Front is most recently used,
//! back is least recently used.

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Access-ordered list with O(1) push, touch and removal by slot.
#[derive(Debug)]
pub struct LruList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of values in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value as most recently used. Returns its slot.
    pub fn push_front(&mut self, value: T) -> usize {
        let node = Node {
            value,
            prev: None,
            next: self.head,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.head.and_then(|head| self.node_mut(head)) {
            Some(head) => head.prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
        slot
    }

    /// Mark the value in `slot` as most recently used.
    pub fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) || self.get(slot).is_none() {
            return;
        }
        self.unlink(slot);
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head.and_then(|head| self.node_mut(head)) {
            head.prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Remove the value in `slot`.
    pub fn remove(&mut self, slot: usize) -> Option<T> {
        self.get(slot)?;
        self.unlink(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        self.len -= 1;
        Some(node.value)
    }

    /// The least recently used value and its slot.
    pub fn back(&self) -> Option<(usize, &T)> {
        let tail = self.tail?;
        self.get(tail).map(|value| (tail, value))
    }

    /// Remove the least recently used value.
    pub fn pop_back(&mut self) -> Option<T> {
        let tail = self.tail?;
        self.remove(tail)
    }

    /// The value in `slot`.
    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(|n| &n.value)
    }

    /// The value in `slot`, mutably.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.node_mut(slot).map(|n| &mut n.value)
    }

    /// Values from most to least recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            next: self.head,
        }
    }

    /// Remove every value, most recently used first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match self.slots[slot].take() {
                Some(node) => {
                    cursor = node.next;
                    values.push(node.value);
                }
                None => break,
            }
        }
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        values
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self
            .node_mut(slot)
            .map(|node| (node.prev.take(), node.next.take()))
        else {
            return;
        };
        match prev.and_then(|p| self.node_mut(p)) {
            Some(node) => node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(node) => node.prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Iterator over an [`LruList`], most recently used first.
pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    next: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let slot = self.next?;
        let node = self.list.slots.get(slot)?.as_ref()?;
        self.next = node.next;
        Some(&node.value)
    }
}
