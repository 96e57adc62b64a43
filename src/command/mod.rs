pub mod record;

pub use record::{start_recording, stop_recording};
