pub mod buffer;
pub mod registry;
