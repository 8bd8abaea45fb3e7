use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::error::{LoaderError, Result};
use crate::transformer::Transformer;
use crate::weights::{block_index, WeightMap};

/// Remove the given transformer blocks and renumber the survivors.
///
/// Every index is checked against the block count before anything changes.
/// Duplicates are ignored.
pub fn remove_blocks(transformer: &mut Transformer, indices: &[usize]) -> Result<()> {
    let num_blocks = transformer.num_blocks();
    if let Some(&index) = indices.iter().find(|&&i| i >= num_blocks) {
        return Err(LoaderError::BlockIndexOutOfRange { index, num_blocks });
    }
    let remove: BTreeSet<usize> = indices.iter().copied().collect();
    if remove.is_empty() {
        return Ok(());
    }

    // old index -> new index for every surviving block
    let renumber: BTreeMap<usize, usize> = (0..num_blocks)
        .filter(|i| !remove.contains(i))
        .enumerate()
        .map(|(new, old)| (old, new))
        .collect();
    let rename = |name: &str| -> Option<String> {
        match block_index(name) {
            Some(old) => {
                let new = renumber.get(&old)?;
                let rest = &name["transformer_blocks.".len() + old.to_string().len()..];
                Some(format!("transformer_blocks.{}{}", new, rest))
            }
            None => Some(name.to_string()),
        }
    };

    let weights = std::mem::take(transformer.weights_mut());
    let renamed: WeightMap = weights
        .into_inner()
        .into_iter()
        .filter_map(|(name, weight)| rename(&name).map(|n| (n, weight)))
        .collect();
    *transformer.weights_mut() = renamed;

    for adapter in transformer.adapters_mut() {
        adapter.targets = adapter
            .targets
            .iter()
            .filter_map(|t| rename(&format!("{}.", t)).map(|n| n.trim_end_matches('.').to_string()))
            .collect();
    }

    transformer.config_mut().num_layers = renumber.len();
    info!(
        "Removed transformer blocks {:?}, {} remain",
        remove,
        renumber.len()
    );
    Ok(())
}
