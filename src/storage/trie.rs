//! Multi-terminal trie: byte sequence -> one or more terminal nodes.
//!
//! Insertion appends; an existing terminal is never overwritten. The first
//! terminal inserted for a payload is its canonical terminal.
//!
//! Child links and terminal chains live in two trie-wide maps so that a
//! batch of insertions can be reserved up front with [`MultiTerminalTrie::try_reserve`].

use hashbrown::HashMap;

use super::alloc_err;
use crate::model::NodeId;
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    first: Option<NodeId>,
    last: Option<NodeId>,
}

/// Arena-backed prefix tree; slot 0 is the root (empty payload).
#[derive(Debug, Clone)]
pub struct MultiTerminalTrie {
    slots: Vec<Slot>,
    /// (parent slot, byte) -> child slot
    children: HashMap<(u32, u8), u32>,
    /// terminal -> next terminal of the same payload
    next: HashMap<NodeId, NodeId>,
    longest: usize,
}

impl MultiTerminalTrie {
    pub fn new() -> Self {
        Self { slots: vec![Slot::default()], children: HashMap::new(), next: HashMap::new(), longest: 0 }
    }

    fn child(&self, at: usize, byte: u8) -> Option<usize> {
        self.children.get(&(at as u32, byte)).map(|s| *s as usize)
    }

    fn find(&self, payload: &[u8]) -> Option<usize> {
        payload.iter().try_fold(0usize, |at, b| self.child(at, *b))
    }

    fn find_or_create(&mut self, payload: &[u8]) -> usize {
        let mut at = 0usize;
        for b in payload {
            at = match self.child(at, *b) {
                Some(next) => next,
                None => {
                    let next = self.slots.len();
                    self.slots.push(Slot::default());
                    self.children.insert((at as u32, *b), next as u32);
                    next
                }
            };
        }
        at
    }

    /// Slots that inserting `payload` would add.
    pub fn missing_slots(&self, payload: &[u8]) -> usize {
        let mut at = 0usize;
        for (i, b) in payload.iter().enumerate() {
            match self.child(at, *b) {
                Some(next) => at = next,
                None => return payload.len() - i,
            }
        }
        0
    }

    /// Room for `slots` new slots and `terminals` new terminals.
    pub fn try_reserve(&mut self, slots: usize, terminals: usize) -> Result<()> {
        self.slots.try_reserve(slots).map_err(|e| alloc_err("trie slots", e))?;
        self.children.try_reserve(slots).map_err(|e| alloc_err("trie links", e))?;
        self.next.try_reserve(terminals).map_err(|e| alloc_err("trie terminals", e))?;
        Ok(())
    }

    /// Append a terminal for `payload`.
    pub fn insert(&mut self, payload: &[u8], node: NodeId) {
        let at = self.find_or_create(payload);
        let slot = &mut self.slots[at];
        match slot.last.replace(node) {
            Some(tail) => {
                self.next.insert(tail, node);
            }
            None => slot.first = Some(node),
        }
        self.longest = self.longest.max(payload.len());
    }

    pub fn canonical(&self, payload: &[u8]) -> Option<NodeId> {
        self.find(payload).and_then(|s| self.slots[s].first)
    }

    /// All terminals for `payload`, in insertion order.
    pub fn terminals(&self, payload: &[u8]) -> Terminals<'_> {
        Terminals { trie: self, at: self.canonical(payload) }
    }

    /// Whether `payload` is a prefix of, or equal to, some inserted payload.
    pub fn has_path(&self, payload: &[u8]) -> bool {
        self.find(payload).is_some()
    }

    pub fn longest_pattern(&self) -> usize {
        self.longest
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Capacities of the slot arena and both maps.
    #[cfg(test)]
    pub(crate) fn capacities(&self) -> (usize, usize, usize) {
        (self.slots.capacity(), self.children.capacity(), self.next.capacity())
    }
}

impl Default for MultiTerminalTrie {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the terminals of one payload.
#[derive(Debug, Clone)]
pub struct Terminals<'a> {
    trie: &'a MultiTerminalTrie,
    at: Option<NodeId>,
}

impl Iterator for Terminals<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.at?;
        self.at = self.trie.next.get(&current).copied();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_appends_terminals() {
        let mut trie = MultiTerminalTrie::new();
        trie.insert(b"ab", NodeId(3));
        trie.insert(b"ab", NodeId(7));
        trie.insert(b"ab", NodeId(5));
        assert_eq!(trie.terminals(b"ab").collect::<Vec<_>>(), vec![NodeId(3), NodeId(7), NodeId(5)]);
        assert_eq!(trie.canonical(b"ab"), Some(NodeId(3)));
    }

    #[test]
    fn test_prefix_paths() {
        let mut trie = MultiTerminalTrie::new();
        trie.insert(b"abc", NodeId(0));
        assert!(trie.has_path(b"ab"));
        assert_eq!(trie.terminals(b"ab").count(), 0);
        assert_eq!(trie.canonical(b"ab"), None);
        assert!(!trie.has_path(b"ac"));
        assert_eq!(trie.longest_pattern(), 3);
    }

    #[test]
    fn test_missing_slots() {
        let mut trie = MultiTerminalTrie::new();
        assert_eq!(trie.missing_slots(b"abc"), 3);
        trie.insert(b"ab", NodeId(0));
        assert_eq!(trie.missing_slots(b"abc"), 1);
        assert_eq!(trie.missing_slots(b"a"), 0);
        assert_eq!(trie.slot_count(), 3);
    }

    #[test]
    fn test_reserved_inserts_do_not_grow() {
        let mut trie = MultiTerminalTrie::new();
        trie.insert(b"ab", NodeId(0));
        trie.try_reserve(trie.missing_slots(b"abcd") + trie.missing_slots(b"xy"), 3).unwrap();
        let reserved = trie.capacities();

        trie.insert(b"abcd", NodeId(1));
        trie.insert(b"xy", NodeId(2));
        trie.insert(b"ab", NodeId(3));
        trie.insert(b"xy", NodeId(4));
        trie.insert(b"xy", NodeId(5));
        assert_eq!(trie.capacities(), reserved);
        assert_eq!(trie.terminals(b"xy").collect::<Vec<_>>(), vec![NodeId(2), NodeId(4), NodeId(5)]);
    }
}
