//! Optimized collection types for Kiln.
//!
//! Re-exports of hash collections using AHash. These are for in-process
//! lookup tables only; anything that must hash identically across runs
//! (asset identities) goes through [`crate::hash`] instead.

pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashmap_ahash() {
        let mut map = HashMap::new();
        map.insert(7u64, "texture");
        assert_eq!(map.get(&7), Some(&"texture"));
    }

    #[test]
    fn test_hashset_ahash() {
        let mut set = HashSet::new();
        set.insert("/main/main.collection");
        assert!(set.contains("/main/main.collection"));
    }
}
