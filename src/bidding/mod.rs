pub mod rotation;

pub use rotation::{select, select_many, SelectionError};
