mod loader;
mod schema;

pub use loader::{load, load_from_path, validate};
pub use schema::{Config, MismatchPolicy};
