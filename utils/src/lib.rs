//! Audio helpers shared by the client core and its binaries.
pub mod audio;
pub mod device;
