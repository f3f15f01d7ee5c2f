mod parser;
mod path;
mod types;

pub use parser::*;
pub use path::*;
pub use types::*;
