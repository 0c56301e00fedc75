/// Hashmap used across stowage. Handles and local ids are not attacker controlled, so this skips
/// the more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Hashset counterpart of [`HashMap`].
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;
