pub mod elasticsearch;
pub mod memory;
#[cfg(test)]
pub mod testing;

pub use elasticsearch::ElasticsearchStore;
pub use memory::InMemoryIndex;
