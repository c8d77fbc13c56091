use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use wav2letter_rs::{LabeledFeatures, ManifestEntry};

/// Reads one `{"label": ..., "features": [[...], ...]}` object per line.
/// Blank lines are skipped.
pub fn read_manifest(path: &Path) -> Result<Vec<LabeledFeatures>, String> {
    let file = File::open(path)
        .map_err(|err| format!("Failed to open manifest '{}': {err}", path.display()))?;
    let mut examples = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| {
            format!("Failed to read manifest '{}': {err}", path.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(&line).map_err(|err| {
            format!("Invalid manifest entry at {}:{}: {err}", path.display(), index + 1)
        })?;
        let example = LabeledFeatures::try_from(entry).map_err(|err| {
            format!("Invalid features at {}:{}: {err}", path.display(), index + 1)
        })?;
        examples.push(example);
    }
    if examples.is_empty() {
        return Err(format!("Manifest '{}' has no examples", path.display()));
    }
    Ok(examples)
}

pub fn batches(examples: &[LabeledFeatures], batch_size: usize) -> Vec<Vec<LabeledFeatures>> {
    examples
        .chunks(batch_size.max(1))
        .map(<[LabeledFeatures]>::to_vec)
        .collect()
}

/// Endless batch stream over `examples`, reshuffled on every pass.
pub fn shuffled_batches(
    examples: Vec<LabeledFeatures>,
    batch_size: usize,
    seed: Option<u64>,
) -> impl Iterator<Item = Vec<LabeledFeatures>> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut order = examples;
    std::iter::repeat(()).flat_map(move |_| {
        order.shuffle(&mut rng);
        batches(&order, batch_size)
    })
}
