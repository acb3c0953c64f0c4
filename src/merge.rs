use std::collections::HashSet;

use crate::types::Endpoint;

/// Return the endpoints of `incoming` whose `(address, port)` is absent from
/// `existing`, in `incoming` order. `existing` is left untouched.
///
/// Duplicates inside `incoming` itself are also collapsed to the first one so
/// the result can be appended without breaking key uniqueness.
pub fn merge(existing: &[Endpoint], incoming: &[Endpoint]) -> Vec<Endpoint> {
    let mut taken: HashSet<(&str, u16)> = existing.iter().map(Endpoint::key).collect();
    incoming
        .iter()
        .filter(|e| taken.insert(e.key()))
        .cloned()
        .collect()
}
