pub mod firestore;
pub mod memory;
pub mod vertex;

pub use firestore::FirestoreStore;
pub use memory::{InMemoryMetadataStore, InMemoryVectorIndex};
pub use vertex::VertexVectorIndex;
