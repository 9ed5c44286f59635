pub mod input_loader;

pub use input_loader::{load_batch_input, load_manifest, scan_items, BatchInput, TaskManifest};
