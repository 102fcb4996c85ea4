//! Tables: an array part for keys `1..=n` plus an insertion-ordered hash part.

use crate::heap::Gc;
use crate::value::Value;
use indexmap::{Equivalent, IndexMap};
use std::hash::{Hash, Hasher};

/// Hashable table key. Never `nil` or NaN; `-0.0` is stored as `0.0`.
#[derive(Debug, Clone)]
pub struct Key(Value);

impl Key {
    /// `None` for keys a table cannot hold.
    pub fn new(value: Value) -> Option<Key> {
        match value {
            Value::Nil => None,
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) if n == 0.0 => Some(Key(Value::Number(0.0))),
            other => Some(Key(other)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_REF: u8 = 4;
const TAG_NATIVE: u8 = 5;

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Nil => 0u8.hash(state),
            Value::Boolean(b) => {
                TAG_BOOL.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                TAG_NUMBER.hash(state);
                n.to_bits().hash(state);
            }
            Value::Str(s) => {
                TAG_STR.hash(state);
                s.as_ref().hash(state);
            }
            Value::Table(g) => (TAG_REF, 0u8, g.index()).hash(state),
            Value::Function(g) => (TAG_REF, 1u8, g.index()).hash(state),
            Value::Thread(g) => (TAG_REF, 2u8, g.index()).hash(state),
            Value::Native(n) => {
                TAG_NATIVE.hash(state);
                n.address().hash(state);
            }
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_eq(&other.0)
    }
}

impl Eq for Key {}

/// Borrowed string key, so field lookups need no allocation.
struct StrKey<'a>(&'a str);

impl Hash for StrKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        TAG_STR.hash(state);
        self.0.hash(state);
    }
}

impl Equivalent<Key> for StrKey<'_> {
    fn equivalent(&self, key: &Key) -> bool {
        matches!(&key.0, Value::Str(s) if &**s == self.0)
    }
}

/// Array index for `n` when it is an integer `>= 1`.
fn array_index(n: f64) -> Option<usize> {
    if n >= 1.0 && n == n.trunc() && n < (usize::MAX / 2) as f64 {
        Some(n as usize)
    } else {
        None
    }
}

/// `next` was given a key that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidKey;

#[derive(Debug, Default)]
pub struct Table {
    /// Values for keys `1..=array.len()`. The last element is never nil.
    array: Vec<Value>,
    /// Other keys. Removed entries stay as nil tombstones so `next` keeps
    /// working while a traversal assigns nil to visited fields.
    hash: IndexMap<Key, Value>,
    tombstones: usize,
    pub metatable: Option<Gc<Table>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narray),
            hash: IndexMap::with_capacity(nhash),
            ..Self::default()
        }
    }

    pub fn from_array(values: Vec<Value>) -> Self {
        let mut t = Self::with_capacity(values.len(), 0);
        for (i, v) in values.into_iter().enumerate() {
            t.set_int(i + 1, v);
        }
        t
    }

    pub fn get(&self, key: &Value) -> Value {
        match key {
            Value::Nil => Value::Nil,
            Value::Number(n) => self.get_number(*n),
            Value::Str(s) => self.get_str(s),
            other => self.get_hashed(other),
        }
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.hash
            .get(&StrKey(key))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn get_int(&self, i: usize) -> Value {
        if i >= 1 && i <= self.array.len() {
            return self.array[i - 1].clone();
        }
        self.get_hashed(&Value::Number(i as f64))
    }

    fn get_number(&self, n: f64) -> Value {
        match array_index(n) {
            Some(i) if i <= self.array.len() => self.array[i - 1].clone(),
            _ => self.get_hashed(&Value::Number(n)),
        }
    }

    fn get_hashed(&self, key: &Value) -> Value {
        match Key::new(key.clone()) {
            Some(k) => self.hash.get(&k).cloned().unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// Raw assignment. The caller has already rejected nil and NaN keys.
    pub fn set(&mut self, key: Value, value: Value) {
        if let Value::Number(n) = key {
            if let Some(i) = array_index(n) {
                self.set_int(i, value);
                return;
            }
        }
        if let Some(k) = Key::new(key) {
            self.set_hashed(k, value);
        }
    }

    pub fn set_str(&mut self, key: &str, value: Value) {
        self.set(Value::str(key), value);
    }

    pub fn set_int(&mut self, i: usize, value: Value) {
        let len = self.array.len();
        if i >= 1 && i <= len {
            self.array[i - 1] = value;
            if i == len {
                while matches!(self.array.last(), Some(Value::Nil)) {
                    self.array.pop();
                }
            }
        } else if i == len + 1 && !value.is_nil() {
            self.array.push(value);
            self.migrate_from_hash();
        } else if let Some(k) = Key::new(Value::Number(i as f64)) {
            self.set_hashed(k, value);
        }
    }

    /// Move keys `len+1, len+2, ...` that sit in the hash part onto the array.
    fn migrate_from_hash(&mut self) {
        if self.hash.is_empty() {
            return;
        }
        loop {
            let next = Key(Value::Number((self.array.len() + 1) as f64));
            match self.hash.get_mut(&next) {
                Some(v) if !v.is_nil() => {
                    let v = std::mem::take(v);
                    self.tombstones += 1;
                    self.array.push(v);
                }
                _ => break,
            }
        }
    }

    fn set_hashed(&mut self, key: Key, value: Value) {
        match self.hash.get_mut(&key) {
            Some(slot) => {
                match (slot.is_nil(), value.is_nil()) {
                    (false, true) => self.tombstones += 1,
                    (true, false) => self.tombstones = self.tombstones.saturating_sub(1),
                    _ => {}
                }
                *slot = value;
            }
            None if value.is_nil() => {}
            None => {
                // New keys may invalidate a traversal anyway, so this is the
                // one place tombstones are dropped.
                if self.tombstones > 8 && self.tombstones * 2 > self.hash.len() {
                    self.hash.retain(|_, v| !v.is_nil());
                    self.tombstones = 0;
                }
                self.hash.insert(key, value);
            }
        }
    }

    /// Border: `t[len] ~= nil` and `t[len + 1] == nil`.
    pub fn len(&self) -> usize {
        if !self.array.is_empty() {
            return self.array.len();
        }
        // Integer keys can sit in the hash part when the array part is empty.
        let mut n = 0;
        while !self.get_hashed(&Value::Number((n + 1) as f64)).is_nil() {
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Traversal step: the entry after `key` (`nil` starts), or `None` once
    /// exhausted.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, InvalidKey> {
        let start = match key {
            Value::Nil => 0,
            Value::Number(n) if array_index(*n).is_some_and(|i| i <= self.array.len()) => {
                array_index(*n).unwrap_or(0)
            }
            other => {
                let k = Key::new(other.clone()).ok_or(InvalidKey)?;
                let idx = self.hash.get_index_of(&k).ok_or(InvalidKey)?;
                return Ok(self.next_in_hash(idx + 1));
            }
        };
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Number((i + 1) as f64), self.array[i].clone())));
            }
        }
        Ok(self.next_in_hash(0))
    }

    fn next_in_hash(&self, from: usize) -> Option<(Value, Value)> {
        (from..self.hash.len()).find_map(|i| {
            let (k, v) = self.hash.get_index(i)?;
            (!v.is_nil()).then(|| (k.0.clone(), v.clone()))
        })
    }

    /// Values of the array part, used by `table.concat`, `unpack` and sorting.
    pub fn array(&self) -> &[Value] {
        &self.array
    }

    /// Every live value and key, for the collector.
    pub(crate) fn for_each_value(&self, mut f: impl FnMut(&Value)) {
        for v in &self.array {
            f(v);
        }
        for (k, v) in &self.hash {
            if !v.is_nil() {
                f(&k.0);
                f(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(x: f64) -> Value {
        Value::Number(x)
    }

    #[test]
    fn set_then_get() {
        let mut t = Table::new();
        t.set(n(1.0), Value::str("a"));
        t.set(Value::str("k"), n(2.0));
        t.set(n(2.5), Value::Boolean(true));
        assert!(t.get(&n(1.0)).raw_eq(&Value::str("a")));
        assert!(t.get(&Value::str("k")).raw_eq(&n(2.0)));
        assert!(t.get(&n(2.5)).raw_eq(&Value::Boolean(true)));
        assert!(t.get_str("k").raw_eq(&n(2.0)));
    }

    #[test]
    fn negative_zero_is_zero() {
        let mut t = Table::new();
        t.set(n(-0.0), Value::str("z"));
        assert!(t.get(&n(0.0)).raw_eq(&Value::str("z")));
    }

    #[test]
    fn length_tracks_array_border() {
        let mut t = Table::new();
        for i in 1..=5 {
            t.set_int(i, n(i as f64));
        }
        assert_eq!(t.len(), 5);
        t.set_int(5, Value::Nil);
        assert_eq!(t.len(), 4);
        t.set_int(5, n(5.0));
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn out_of_order_integer_keys_migrate() {
        let mut t = Table::new();
        t.set_int(3, n(3.0));
        t.set_int(2, n(2.0));
        assert_eq!(t.array().len(), 0);
        t.set_int(1, n(1.0));
        assert_eq!(t.array().len(), 3);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn nil_assignment_removes_from_iteration() {
        let mut t = Table::new();
        t.set(Value::str("a"), n(1.0));
        t.set(Value::str("b"), n(2.0));
        t.set(Value::str("a"), Value::Nil);
        let mut keys = Vec::new();
        let mut k = Value::Nil;
        while let Ok(Some((key, _))) = t.next(&k) {
            keys.push(key.to_string());
            k = key;
        }
        assert_eq!(keys, vec!["b"]);
    }

    #[test]
    fn traversal_survives_clearing_visited_fields() {
        let mut t = Table::new();
        for i in 0..20 {
            t.set(Value::str(&format!("k{i}")), n(i as f64));
        }
        let mut k = Value::Nil;
        let mut seen = 0;
        while let Ok(Some((key, _))) = t.next(&k) {
            t.set(key.clone(), Value::Nil);
            seen += 1;
            k = key;
        }
        assert_eq!(seen, 20);
        assert!(t.next(&Value::Nil).unwrap().is_none());
    }

    #[test]
    fn next_rejects_unknown_key() {
        let t = Table::new();
        assert!(t.next(&Value::str("missing")).is_err());
    }

    #[test]
    fn array_then_hash_order() {
        let mut t = Table::from_array(vec![n(10.0), n(20.0)]);
        t.set(Value::str("x"), n(30.0));
        let (k1, _) = t.next(&Value::Nil).unwrap().unwrap();
        let (k2, _) = t.next(&k1).unwrap().unwrap();
        let (k3, v3) = t.next(&k2).unwrap().unwrap();
        assert!(k1.raw_eq(&n(1.0)));
        assert!(k2.raw_eq(&n(2.0)));
        assert!(k3.raw_eq(&Value::str("x")));
        assert!(v3.raw_eq(&n(30.0)));
        assert!(t.next(&k3).unwrap().is_none());
    }
}
