//! Benchmark utilities.

use caskdb_core::{Config, Engine};
use rand::Rng;
use tempfile::TempDir;

/// Generate random value bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct keys with a common prefix.
pub fn generate_keys(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("key:{i:08}").into_bytes())
        .collect()
}

/// Generate key/value pairs with the specified value size.
pub fn generate_pairs(count: usize, value_size: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    generate_keys(count)
        .into_iter()
        .map(|key| (key, random_data(value_size)))
        .collect()
}

/// Open an engine in a fresh temporary directory.
///
/// The directory lives as long as the returned guard.
pub fn temp_engine(config: Config) -> Result<(TempDir, Engine), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open_with_config(dir.path(), config)?;
    Ok((dir, engine))
}
