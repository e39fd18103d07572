//! Wire types for the recognition and generation channels.
pub mod audio;
pub mod events;
mod request;

pub use events::generation::{GenerationClientEvent, GenerationServerEvent};
pub use events::recognition::{RecognitionClientEvent, RecognitionServerEvent};
pub use request::RequestId;
