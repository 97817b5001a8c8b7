//! Multi-version metadata: descriptors and the manager that publishes them.

pub mod descriptor;
pub mod manager;

pub use descriptor::{FileRef, VersionDescriptor};
pub use manager::{PinHandle, VersionManager};
