//! Runtime instances and the registry that names them

pub mod instance;
pub mod registry;

pub use instance::{RuntimeInstance, RuntimeStats};
pub use registry::ClientRegistry;
