pub mod azure;
pub mod memory;

pub use azure::AzureSearchStore;
pub use memory::InMemoryIndex;
