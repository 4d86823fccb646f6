//! Order-independent identifiers for pair and group entities.

/// Returns the two participants in canonical (lexicographic) order.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// `namespace:min__max`. Commutative in `a` and `b`.
pub fn pair_id(namespace: &str, a: &str, b: &str) -> String {
    let (low, high) = canonical_pair(a, b);
    format!("{namespace}:{low}__{high}")
}

/// Entity key used when a row carries no explicit entity id: the two boundary
/// participants, canonicalized the same way as [`pair_id`].
pub fn derived_entity_id(a: &str, b: &str) -> String {
    let (low, high) = canonical_pair(a, b);
    format!("{low}__{high}")
}
