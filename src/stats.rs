//! Corpus statistics and health overview.
//!
//! Provides a quick summary of what's indexed: file counts, chunk
//! counts, embedding coverage, and snapshot location.

use crate::config::Config;
use crate::store::CorpusStore;

pub fn print_stats(config: &Config, store: &CorpusStore) {
    let files = store.file_count();
    let chunks = store.chunk_count();
    let embedded = store.embedded_count();

    println!("corpus");
    println!("  files: {}", files);
    println!("  chunks: {}", chunks);
    println!("  embedded: {}", embedded);
    if chunks > 0 {
        let coverage = (embedded as f64 / chunks as f64) * 100.0;
        println!("  coverage: {:.1}%", coverage);
    }
    println!("  snapshot: {}", config.store.path.display());

    match std::fs::metadata(&config.store.path) {
        Ok(meta) => println!("  snapshot size: {} bytes", meta.len()),
        Err(_) => println!("  snapshot size: (not yet saved)"),
    }
}
