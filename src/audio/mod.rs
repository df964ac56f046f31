//! Real audio devices via cpal.

pub mod input;
pub mod output;

pub use input::CpalInput;
pub use output::CpalOutput;
