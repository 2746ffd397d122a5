pub mod node;
pub mod pool;
pub mod scan;

pub use node::*;
pub use pool::*;
pub use scan::*;
