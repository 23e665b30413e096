// Virtual machine descriptions

pub mod descriptor;

// Re-exports
pub use descriptor::{DescriptorError, DomainParser, LibvirtDomainParser, VmDescriptor};
