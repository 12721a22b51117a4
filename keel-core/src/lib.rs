pub mod error;
pub mod keys;
pub mod model;
pub mod transition;

pub use error::CoreError;
pub use keys::Keys;
