use std::mem;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{data::log_record::LogRecordPos, errors::Result};

use super::{IndexIterator, Indexer, SnapshotIterator};

/// Adaptive radix tree index.
pub struct AdaptiveRadixTree {
  tree: RwLock<RadixTree>,
}

impl AdaptiveRadixTree {
  pub fn new() -> Self {
    Self {
      tree: RwLock::new(RadixTree::new()),
    }
  }
}

impl Default for AdaptiveRadixTree {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for AdaptiveRadixTree {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.insert(key, pos))
  }

  fn get(&self, key: Vec<u8>) -> Option<LogRecordPos> {
    let read_guard = self.tree.read();
    read_guard.get(&key)
  }

  fn delete(&self, key: Vec<u8>) -> Result<Option<LogRecordPos>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.remove(&key))
  }

  fn size(&self) -> usize {
    self.tree.read().len()
  }

  fn list_keys(&self) -> Result<Vec<Bytes>> {
    let read_guard = self.tree.read();
    let mut keys = Vec::with_capacity(read_guard.len());
    read_guard.for_each(|key, _| keys.push(Bytes::copy_from_slice(key)));
    Ok(keys)
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
    let read_guard = self.tree.read();
    let mut items = Vec::with_capacity(read_guard.len());
    read_guard.for_each(|key, pos| items.push((key.to_vec(), *pos)));
    Box::new(SnapshotIterator::new(items, reverse))
  }
}

/// A radix tree over byte strings whose inner nodes pick their fan-out
/// representation (4, 16, 48 or 256 children) from their current size.
/// Single-child paths are compressed into the prefix of the node below.
pub(crate) struct RadixTree {
  root: Option<Node>,
  len: usize,
}

#[derive(Default)]
struct Leaf {
  key: Vec<u8>,
  pos: LogRecordPos,
}

enum Node {
  Leaf(Leaf),
  Inner(Box<Inner>),
}

impl Default for Node {
  fn default() -> Self {
    Node::Leaf(Leaf::default())
  }
}

struct Inner {
  prefix: Vec<u8>,
  /// the key ending exactly at this node
  terminal: Option<Leaf>,
  children: Children,
}

enum Children {
  Node4 {
    keys: Vec<u8>,
    nodes: Vec<Node>,
  },
  Node16 {
    keys: Vec<u8>,
    nodes: Vec<Node>,
  },
  /// `index[byte]` is the slot + 1 of the child, 0 when absent
  Node48 {
    index: Box<[u8; 256]>,
    slots: Vec<Option<Node>>,
    len: usize,
  },
  Node256 {
    slots: Vec<Option<Node>>,
    len: usize,
  },
}

impl RadixTree {
  pub(crate) fn new() -> Self {
    Self { root: None, len: 0 }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  pub(crate) fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
    let mut node = self.root.as_ref()?;
    let mut depth = 0;
    loop {
      match node {
        Node::Leaf(leaf) => return (leaf.key == key).then_some(leaf.pos),
        Node::Inner(inner) => {
          if !key[depth..].starts_with(&inner.prefix) {
            return None;
          }
          depth += inner.prefix.len();
          if depth == key.len() {
            return inner.terminal.as_ref().map(|leaf| leaf.pos);
          }
          node = inner.children.find(key[depth])?;
          depth += 1;
        }
      }
    }
  }

  pub(crate) fn insert(&mut self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
    let old = if let Some(root) = self.root.as_mut() {
      insert_rec(root, key, pos, 0)
    } else {
      self.root = Some(Node::Leaf(Leaf { key, pos }));
      None
    };
    if old.is_none() {
      self.len += 1;
    }
    old
  }

  pub(crate) fn remove(&mut self, key: &[u8]) -> Option<LogRecordPos> {
    let (removed, empty) = match self.root.as_mut() {
      Some(root) => remove_rec(root, key, 0),
      None => return None,
    };
    if empty {
      self.root = None;
    }
    if removed.is_some() {
      self.len -= 1;
    }
    removed
  }

  /// Visits every entry in ascending key order.
  pub(crate) fn for_each<F>(&self, mut f: F)
  where
    F: FnMut(&[u8], &LogRecordPos),
  {
    if let Some(root) = &self.root {
      root.walk(&mut |leaf: &Leaf| f(&leaf.key, &leaf.pos));
    }
  }
}

fn insert_rec(node: &mut Node, key: Vec<u8>, pos: LogRecordPos, depth: usize) -> Option<LogRecordPos> {
  match node {
    Node::Leaf(leaf) if leaf.key == key => Some(mem::replace(&mut leaf.pos, pos)),
    Node::Leaf(leaf) => {
      let common = common_prefix_len(&leaf.key[depth..], &key[depth..]);
      let split = depth + common;
      let mut inner = Inner::new(key[depth..split].to_vec());
      if let Node::Leaf(old_leaf) = mem::take(node) {
        inner.add_leaf(old_leaf, split);
      }
      inner.add_leaf(Leaf { key, pos }, split);
      *node = Node::Inner(Box::new(inner));
      None
    }
    Node::Inner(inner) => {
      let matched = common_prefix_len(&inner.prefix, &key[depth..]);
      if matched < inner.prefix.len() {
        // the key leaves the compressed path, split it
        let split = depth + matched;
        let mut parent = Inner::new(inner.prefix[..matched].to_vec());
        let edge = inner.prefix[matched];
        inner.prefix = inner.prefix[matched + 1..].to_vec();
        parent.children.add(edge, mem::take(node));
        parent.add_leaf(Leaf { key, pos }, split);
        *node = Node::Inner(Box::new(parent));
        return None;
      }

      let depth = depth + inner.prefix.len();
      if key.len() == depth {
        return match &mut inner.terminal {
          Some(leaf) => Some(mem::replace(&mut leaf.pos, pos)),
          None => {
            inner.terminal = Some(Leaf { key, pos });
            None
          }
        };
      }

      let edge = key[depth];
      if let Some(child) = inner.children.find_mut(edge) {
        return insert_rec(child, key, pos, depth + 1);
      }
      inner.children.add(edge, Node::Leaf(Leaf { key, pos }));
      None
    }
  }
}

/// Returns the removed position and whether `node` became empty.
fn remove_rec(node: &mut Node, key: &[u8], depth: usize) -> (Option<LogRecordPos>, bool) {
  let inner = match node {
    Node::Leaf(leaf) if leaf.key == key => return (Some(leaf.pos), true),
    Node::Leaf(_) => return (None, false),
    Node::Inner(inner) => inner,
  };

  if !key[depth..].starts_with(&inner.prefix) {
    return (None, false);
  }
  let depth = depth + inner.prefix.len();

  let removed = if key.len() == depth {
    inner.terminal.take().map(|leaf| leaf.pos)
  } else {
    let edge = key[depth];
    let (removed, child_empty) = match inner.children.find_mut(edge) {
      Some(child) => remove_rec(child, key, depth + 1),
      None => return (None, false),
    };
    if child_empty {
      inner.children.remove(edge);
    }
    removed
  };
  if removed.is_none() {
    return (None, false);
  }

  match (inner.children.len(), inner.terminal.is_some()) {
    (0, false) => return (removed, true),
    (0, true) => {
      if let Some(leaf) = inner.terminal.take() {
        *node = Node::Leaf(leaf);
      }
    }
    (1, false) => {
      // merge the node with its only child
      let children = mem::replace(&mut inner.children, Children::new());
      let prefix = mem::take(&mut inner.prefix);
      if let Some((edge, child)) = children.into_only_child() {
        *node = match child {
          Node::Leaf(leaf) => Node::Leaf(leaf),
          Node::Inner(mut child_inner) => {
            let mut merged = prefix;
            merged.push(edge);
            merged.extend_from_slice(&child_inner.prefix);
            child_inner.prefix = merged;
            Node::Inner(child_inner)
          }
        };
      }
    }
    _ => {}
  }
  (removed, false)
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
  a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl Node {
  fn walk<F>(&self, f: &mut F)
  where
    F: FnMut(&Leaf),
  {
    match self {
      Node::Leaf(leaf) => f(leaf),
      Node::Inner(inner) => {
        // a key ending here sorts before every longer key below it
        if let Some(leaf) = &inner.terminal {
          f(leaf);
        }
        inner.children.walk(f);
      }
    }
  }
}

impl Inner {
  fn new(prefix: Vec<u8>) -> Self {
    Self {
      prefix,
      terminal: None,
      children: Children::new(),
    }
  }

  fn add_leaf(&mut self, leaf: Leaf, depth: usize) {
    if leaf.key.len() == depth {
      self.terminal = Some(leaf);
    } else {
      let edge = leaf.key[depth];
      self.children.add(edge, Node::Leaf(leaf));
    }
  }
}

impl Children {
  fn new() -> Self {
    Children::Node4 {
      keys: Vec::with_capacity(4),
      nodes: Vec::with_capacity(4),
    }
  }

  fn len(&self) -> usize {
    match self {
      Children::Node4 { keys, .. } | Children::Node16 { keys, .. } => keys.len(),
      Children::Node48 { len, .. } | Children::Node256 { len, .. } => *len,
    }
  }

  fn is_full(&self) -> bool {
    match self {
      Children::Node4 { keys, .. } => keys.len() >= 4,
      Children::Node16 { keys, .. } => keys.len() >= 16,
      Children::Node48 { len, .. } => *len >= 48,
      Children::Node256 { .. } => false,
    }
  }

  fn find(&self, byte: u8) -> Option<&Node> {
    match self {
      Children::Node4 { keys, nodes } | Children::Node16 { keys, nodes } => {
        keys.binary_search(&byte).ok().map(|i| &nodes[i])
      }
      Children::Node48 { index, slots, .. } => match index[byte as usize] {
        0 => None,
        slot => slots[slot as usize - 1].as_ref(),
      },
      Children::Node256 { slots, .. } => slots[byte as usize].as_ref(),
    }
  }

  fn find_mut(&mut self, byte: u8) -> Option<&mut Node> {
    match self {
      Children::Node4 { keys, nodes } | Children::Node16 { keys, nodes } => {
        keys.binary_search(&byte).ok().map(|i| &mut nodes[i])
      }
      Children::Node48 { index, slots, .. } => match index[byte as usize] {
        0 => None,
        slot => slots[slot as usize - 1].as_mut(),
      },
      Children::Node256 { slots, .. } => slots[byte as usize].as_mut(),
    }
  }

  /// `byte` must not have a child yet.
  fn add(&mut self, byte: u8, node: Node) {
    if self.is_full() {
      self.grow();
    }
    match self {
      Children::Node4 { keys, nodes } | Children::Node16 { keys, nodes } => {
        let i = keys.binary_search(&byte).unwrap_or_else(|i| i);
        keys.insert(i, byte);
        nodes.insert(i, node);
      }
      Children::Node48 { index, slots, len } => {
        match slots.iter().position(Option::is_none) {
          Some(slot) => {
            slots[slot] = Some(node);
            index[byte as usize] = slot as u8 + 1;
          }
          None => {
            slots.push(Some(node));
            index[byte as usize] = slots.len() as u8;
          }
        }
        *len += 1;
      }
      Children::Node256 { slots, len } => {
        slots[byte as usize] = Some(node);
        *len += 1;
      }
    }
  }

  fn remove(&mut self, byte: u8) -> Option<Node> {
    let removed = match self {
      Children::Node4 { keys, nodes } | Children::Node16 { keys, nodes } => {
        match keys.binary_search(&byte) {
          Ok(i) => {
            keys.remove(i);
            Some(nodes.remove(i))
          }
          Err(_) => None,
        }
      }
      Children::Node48 { index, slots, len } => match index[byte as usize] {
        0 => None,
        slot => {
          index[byte as usize] = 0;
          *len -= 1;
          slots[slot as usize - 1].take()
        }
      },
      Children::Node256 { slots, len } => {
        let node = slots[byte as usize].take();
        if node.is_some() {
          *len -= 1;
        }
        node
      }
    };
    if removed.is_some() {
      self.shrink();
    }
    removed
  }

  fn grow(&mut self) {
    *self = match mem::replace(self, Children::new()) {
      Children::Node4 { mut keys, mut nodes } => {
        keys.reserve(12);
        nodes.reserve(12);
        Children::Node16 { keys, nodes }
      }
      Children::Node16 { keys, nodes } => {
        let mut index = Box::new([0u8; 256]);
        let mut slots = Vec::with_capacity(48);
        let len = keys.len();
        for (byte, node) in keys.into_iter().zip(nodes) {
          slots.push(Some(node));
          index[byte as usize] = slots.len() as u8;
        }
        Children::Node48 { index, slots, len }
      }
      Children::Node48 {
        index,
        mut slots,
        len,
      } => {
        let mut wide: Vec<Option<Node>> = (0..256).map(|_| None).collect();
        for (byte, slot) in index.iter().enumerate() {
          if *slot != 0 {
            wide[byte] = slots[*slot as usize - 1].take();
          }
        }
        Children::Node256 { slots: wide, len }
      }
      full => full,
    };
  }

  fn shrink(&mut self) {
    let len = self.len();
    let should_shrink = match self {
      Children::Node4 { .. } => false,
      Children::Node16 { .. } => len <= 3,
      Children::Node48 { .. } => len <= 12,
      Children::Node256 { .. } => len <= 36,
    };
    if !should_shrink {
      return;
    }

    *self = match mem::replace(self, Children::new()) {
      Children::Node16 { keys, nodes } => Children::Node4 { keys, nodes },
      Children::Node48 {
        index, mut slots, ..
      } => {
        let mut keys = Vec::with_capacity(16);
        let mut nodes = Vec::with_capacity(16);
        for (byte, slot) in index.iter().enumerate() {
          if *slot != 0 {
            if let Some(node) = slots[*slot as usize - 1].take() {
              keys.push(byte as u8);
              nodes.push(node);
            }
          }
        }
        Children::Node16 { keys, nodes }
      }
      Children::Node256 { mut slots, len } => {
        let mut index = Box::new([0u8; 256]);
        let mut narrow = Vec::with_capacity(48);
        for (byte, slot) in slots.iter_mut().enumerate() {
          if let Some(node) = slot.take() {
            narrow.push(Some(node));
            index[byte] = narrow.len() as u8;
          }
        }
        Children::Node48 {
          index,
          slots: narrow,
          len,
        }
      }
      small => small,
    };
  }

  fn into_only_child(self) -> Option<(u8, Node)> {
    match self {
      Children::Node4 { keys, nodes } | Children::Node16 { keys, nodes } => {
        keys.into_iter().zip(nodes).next()
      }
      Children::Node48 {
        index, mut slots, ..
      } => {
        let byte = index.iter().position(|slot| *slot != 0)?;
        let slot = index[byte] as usize - 1;
        slots[slot].take().map(|node| (byte as u8, node))
      }
      Children::Node256 { slots, .. } => slots
        .into_iter()
        .enumerate()
        .find_map(|(byte, slot)| slot.map(|node| (byte as u8, node))),
    }
  }

  fn walk<F>(&self, f: &mut F)
  where
    F: FnMut(&Leaf),
  {
    match self {
      Children::Node4 { nodes, .. } | Children::Node16 { nodes, .. } => {
        for node in nodes {
          node.walk(f);
        }
      }
      Children::Node48 { index, slots, .. } => {
        for slot in index.iter() {
          if *slot != 0 {
            if let Some(node) = &slots[*slot as usize - 1] {
              node.walk(f);
            }
          }
        }
      }
      Children::Node256 { slots, .. } => {
        for node in slots.iter().flatten() {
          node.walk(f);
        }
      }
    }
  }

  #[cfg(test)]
  fn kind(&self) -> &'static str {
    match self {
      Children::Node4 { .. } => "node4",
      Children::Node16 { .. } => "node16",
      Children::Node48 { .. } => "node48",
      Children::Node256 { .. } => "node256",
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use rand::Rng;

  use super::*;
  use crate::index::tests::{check_indexer_contract, pos};

  impl RadixTree {
    fn root_kind(&self) -> Option<&'static str> {
      match &self.root {
        Some(Node::Inner(inner)) => Some(inner.children.kind()),
        _ => None,
      }
    }

    fn keys(&self) -> Vec<Vec<u8>> {
      let mut keys = Vec::new();
      self.for_each(|k, _| keys.push(k.to_vec()));
      keys
    }
  }

  #[test]
  fn test_art_contract() {
    let art = AdaptiveRadixTree::new();
    check_indexer_contract(&art);
  }

  #[test]
  fn test_art_prefix_keys() {
    let mut tree = RadixTree::new();
    assert_eq!(tree.insert(b"romane".to_vec(), pos(0, 1)), None);
    assert_eq!(tree.insert(b"romanus".to_vec(), pos(0, 2)), None);
    assert_eq!(tree.insert(b"roman".to_vec(), pos(0, 3)), None);
    assert_eq!(tree.insert(b"rom".to_vec(), pos(0, 4)), None);
    assert_eq!(tree.insert(b"rubens".to_vec(), pos(0, 5)), None);
    assert_eq!(tree.insert(b"".to_vec(), pos(0, 6)), None);
    assert_eq!(tree.len(), 6);

    assert_eq!(tree.get(b"roman"), Some(pos(0, 3)));
    assert_eq!(tree.get(b"rom"), Some(pos(0, 4)));
    assert_eq!(tree.get(b""), Some(pos(0, 6)));
    assert_eq!(tree.get(b"ro"), None);
    assert_eq!(tree.get(b"romanes"), None);

    assert_eq!(
      tree.keys(),
      vec![
        b"".to_vec(),
        b"rom".to_vec(),
        b"roman".to_vec(),
        b"romane".to_vec(),
        b"romanus".to_vec(),
        b"rubens".to_vec(),
      ]
    );

    assert_eq!(tree.remove(b"roman"), Some(pos(0, 3)));
    assert_eq!(tree.remove(b"roman"), None);
    assert_eq!(tree.get(b"romane"), Some(pos(0, 1)));
    assert_eq!(tree.remove(b"romane"), Some(pos(0, 1)));
    assert_eq!(tree.get(b"romanus"), Some(pos(0, 2)));
    assert_eq!(tree.remove(b""), Some(pos(0, 6)));
    assert_eq!(tree.len(), 3);
    assert_eq!(
      tree.keys(),
      vec![b"rom".to_vec(), b"romanus".to_vec(), b"rubens".to_vec()]
    );
  }

  #[test]
  fn test_art_node_grow_and_shrink() {
    let mut tree = RadixTree::new();
    let key = |b: u8| vec![b'k', b];

    for b in 0..4u8 {
      tree.insert(key(b), pos(0, b as u64));
    }
    assert_eq!(tree.root_kind(), Some("node4"));
    tree.insert(key(4), pos(0, 4));
    assert_eq!(tree.root_kind(), Some("node16"));
    for b in 5..17u8 {
      tree.insert(key(b), pos(0, b as u64));
    }
    assert_eq!(tree.root_kind(), Some("node48"));
    for b in 17..=255u8 {
      tree.insert(key(b), pos(0, b as u64));
    }
    assert_eq!(tree.root_kind(), Some("node256"));
    assert_eq!(tree.len(), 256);
    for b in 0..=255u8 {
      assert_eq!(tree.get(&key(b)), Some(pos(0, b as u64)));
    }

    // remove from the top so the remaining keys stay contiguous
    for b in (36..=255u8).rev() {
      assert_eq!(tree.remove(&key(b)), Some(pos(0, b as u64)));
    }
    assert_eq!(tree.root_kind(), Some("node48"));
    for b in (12..36u8).rev() {
      tree.remove(&key(b));
    }
    assert_eq!(tree.root_kind(), Some("node16"));
    for b in (3..12u8).rev() {
      tree.remove(&key(b));
    }
    assert_eq!(tree.root_kind(), Some("node4"));
    assert_eq!(tree.keys(), vec![key(0), key(1), key(2)]);

    tree.remove(&key(0));
    tree.remove(&key(1));
    // a single leaf is left, the inner node collapsed into it
    assert_eq!(tree.root_kind(), None);
    assert_eq!(tree.get(&key(2)), Some(pos(0, 2)));
    tree.remove(&key(2));
    assert_eq!(tree.len(), 0);
    assert!(tree.keys().is_empty());
  }

  #[test]
  fn test_art_matches_btreemap() {
    let mut rng = rand::rng();
    let mut tree = RadixTree::new();
    let mut model = BTreeMap::new();

    for i in 0..5000u64 {
      let len = rng.random_range(0..4);
      let key: Vec<u8> = (0..len).map(|_| rng.random_range(0..6u8)).collect();
      if rng.random_bool(0.6) {
        let p = pos(1, i);
        assert_eq!(tree.insert(key.clone(), p), model.insert(key, p));
      } else {
        assert_eq!(tree.remove(&key), model.remove(&key));
      }
      assert_eq!(tree.len(), model.len());
    }

    let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(tree.keys(), expected);
    for (key, p) in model.iter() {
      assert_eq!(tree.get(key), Some(*p));
    }
  }
}
