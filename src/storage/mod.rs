pub mod path;
pub mod store;

pub use store::{SharedRoot, SharedStore};
