//! Generational keys for engine-side objects (geometries, tasks).
//!
//! Keys come from a [`SlotMap`]: a key to a removed value never resolves again,
//! even after its slot is reused, so a stale handle is rejected instead of
//! aliasing the new object.

use slotmap::new_key_type;
pub use slotmap::{Key, KeyData, SlotMap};

new_key_type! {
    /// Registered geometry.
    pub struct GeometryKey;
    /// Engine-side record of one submitted task.
    pub struct EngineTaskKey;
}

/// Pack a key into a single 64-bit value for crossing an FFI boundary.
#[must_use]
pub fn key_to_bits<K: Key>(key: K) -> u64 {
    key.data().as_ffi()
}

/// Inverse of [`key_to_bits`]. Validation happens on lookup.
#[must_use]
pub fn key_from_bits<K: Key>(bits: u64) -> K {
    KeyData::from_ffi(bits).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_key_rejected_after_reuse() {
        let mut geometries = SlotMap::<GeometryKey, &str>::with_key();
        let old = geometries.insert("old");
        assert_eq!(geometries.remove(old), Some("old"));

        let new = geometries.insert("new");
        assert_ne!(new, old);
        assert_eq!(geometries.get(old), None);
        assert_eq!(geometries.remove(old), None);
        assert_eq!(geometries.get(new), Some(&"new"));
    }

    #[test]
    fn bits_keep_identity() {
        let mut tasks = SlotMap::<EngineTaskKey, u8>::with_key();
        tasks.insert(0);
        let key = tasks.insert(7);

        let back: EngineTaskKey = key_from_bits(key_to_bits(key));
        assert_eq!(back, key);
        assert_eq!(tasks.get(back), Some(&7));
    }

    #[test]
    fn null_key_never_resolves() {
        let geometries = SlotMap::<GeometryKey, u8>::with_key();
        assert!(!geometries.contains_key(GeometryKey::null()));
        assert!(!geometries.contains_key(key_from_bits::<GeometryKey>(42)));
    }
}
