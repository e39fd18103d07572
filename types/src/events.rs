pub mod generation;
pub mod recognition;
