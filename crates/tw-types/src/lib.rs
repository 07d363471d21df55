pub mod errors;
pub mod params;
pub mod trial;

pub use errors::*;
pub use params::*;
pub use trial::*;
