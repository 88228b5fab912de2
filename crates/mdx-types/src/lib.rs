pub mod instrument;
pub mod status;
pub mod errors;

pub use instrument::*;
pub use status::*;
pub use errors::*;
