pub mod scan_state;

pub use scan_state::{ScanStateRepository, StateStore};
