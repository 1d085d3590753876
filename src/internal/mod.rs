pub mod background_thread;
pub mod data_types;
pub mod events;
pub mod gate;
pub mod history;
pub mod registry;
pub mod signaling;
