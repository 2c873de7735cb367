pub mod money;
pub mod pii;

pub use money::{Money, Rate, RateError};
pub use pii::Masked;
