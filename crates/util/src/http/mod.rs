pub mod parser;
pub mod transport;

pub use parser::*;
pub use transport::*;
