//! Cache keys
//!
//! Deterministic identity of a query invocation: statement id, row range,
//! final SQL, and every bound parameter value, in order. Hashcode, checksum
//! and component count short-circuit comparison before the full in-order
//! component check.

use sqlweave_rdbc::Value;

const MULTIPLIER: i64 = 37;
const SEED: i64 = 17;

/// Composable cache key over an ordered component sequence
#[derive(Debug, Clone)]
pub struct CacheKey {
    hashcode: i64,
    checksum: i64,
    count: usize,
    components: Vec<Value>,
    null: bool,
}

impl CacheKey {
    /// An empty key
    pub fn new() -> Self {
        Self {
            hashcode: SEED,
            checksum: 0,
            count: 0,
            components: Vec::new(),
            null: false,
        }
    }

    /// The null sentinel: marks invocations that must never be cached. It
    /// equals only other null keys and ignores appended components.
    pub fn null() -> Self {
        Self {
            null: true,
            ..Self::new()
        }
    }

    /// Whether this is the null sentinel
    pub fn is_null(&self) -> bool {
        self.null
    }

    /// Append one component. The null sentinel accumulates nothing.
    pub fn update(&mut self, component: Value) {
        if self.null {
            return;
        }
        let base = if component.is_null() {
            1
        } else {
            component.stable_hash() as i64
        };
        self.count += 1;
        self.checksum = self.checksum.wrapping_add(base);
        let positioned = base.wrapping_mul(self.count as i64);
        self.hashcode = self
            .hashcode
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(positioned);
        self.components.push(component);
    }

    /// Append several components
    pub fn update_all(&mut self, components: impl IntoIterator<Item = Value>) {
        for c in components {
            self.update(c);
        }
    }

    /// Number of components
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Default for CacheKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        if self.null != other.null {
            return false;
        }
        if self.hashcode != other.hashcode
            || self.checksum != other.checksum
            || self.count != other.count
        {
            return false;
        }
        self.components == other.components
    }
}

impl Eq for CacheKey {}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_i64(self.hashcode);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.null {
            return write!(f, "null-cache-key");
        }
        write!(f, "{}:{}", self.hashcode, self.checksum)?;
        for c in &self.components {
            write!(f, ":{}", c.render())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(components: &[Value]) -> CacheKey {
        let mut key = CacheKey::new();
        key.update_all(components.iter().cloned());
        key
    }

    #[test]
    fn equal_component_sequences_are_equal() {
        let a = key_of(&[Value::from("u.findById"), Value::from(7_i64)]);
        let b = key_of(&[Value::from("u.findById"), Value::from(7_i64)]);
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn differing_components_differ() {
        let a = key_of(&[Value::from("u.findById"), Value::from(7_i64)]);
        let b = key_of(&[Value::from("u.findById"), Value::from(8_i64)]);
        assert_ne!(a, b);
    }

    #[test]
    fn order_matters() {
        let a = key_of(&[Value::from(1_i64), Value::from(2_i64)]);
        let b = key_of(&[Value::from(2_i64), Value::from(1_i64)]);
        assert_ne!(a, b);
    }

    #[test]
    fn null_components_participate() {
        let a = key_of(&[Value::Null]);
        let b = key_of(&[Value::Null]);
        let c = key_of(&[Value::Null, Value::Null]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn empty_keys_are_equal() {
        assert_eq!(CacheKey::new(), CacheKey::default());
    }

    #[test]
    fn null_sentinel_equals_only_other_null_keys() {
        let null = CacheKey::null();
        assert!(null.is_null());
        assert_eq!(null, CacheKey::null());
        assert_ne!(null, CacheKey::new());
        assert_ne!(null, key_of(&[Value::from(1_i64)]));
    }

    #[test]
    fn null_sentinel_accumulates_nothing() {
        let mut null = CacheKey::null();
        null.update(Value::from(1_i64));
        assert_eq!(null.count(), 0);
        assert_eq!(null, CacheKey::null());
        assert_eq!(null.to_string(), "null-cache-key");
    }
}
