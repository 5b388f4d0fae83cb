pub mod round;
pub mod candidate;
pub mod bunch;
pub mod config;
pub mod errors;

pub use round::*;
pub use candidate::*;
pub use bunch::*;
pub use config::*;
pub use errors::*;
