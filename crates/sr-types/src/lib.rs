pub mod errors;
pub mod expression;
pub mod input;
pub mod messages;
pub mod module;
pub mod optimization;
pub mod parameters;
pub mod sample;

pub use errors::*;
pub use expression::*;
pub use input::*;
pub use messages::*;
pub use module::*;
pub use optimization::*;
pub use parameters::*;
pub use sample::*;
