use std::collections::HashSet;

use super::{IndexDefinition, IndexKind};

/// Side by side rebuilds are named with this prefix and the index they replace.
pub const REPLACEMENT_PREFIX: &str = "ReplacementOf/";

fn replaced_name(name: &str) -> Option<&str> {
    let prefix = name.get(..REPLACEMENT_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(REPLACEMENT_PREFIX) {
        return None;
    }

    name.get(REPLACEMENT_PREFIX.len()..)
        .filter(|name| !name.is_empty())
}

/// The index definitions to export.
///
/// Faulty indexes are skipped. A side by side rebuild is exported under the
/// name of the index it replaces, instead of that index.
pub fn coalesce_indexes(definitions: Vec<IndexDefinition>) -> Vec<IndexDefinition> {
    let replaced: HashSet<String> = definitions
        .iter()
        .filter(|definition| definition.kind != IndexKind::Faulty)
        .filter_map(|definition| replaced_name(&definition.name))
        .map(str::to_lowercase)
        .collect();

    definitions
        .into_iter()
        .filter(|definition| definition.kind != IndexKind::Faulty)
        .filter_map(|mut definition| {
            if let Some(final_name) = replaced_name(&definition.name) {
                definition.name = final_name.to_string();
                return Some(definition);
            }

            if replaced.contains(&definition.name.to_lowercase()) {
                return None;
            }

            Some(definition)
        })
        .collect()
}
