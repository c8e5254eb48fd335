pub mod memory;
pub mod traits;

pub use memory::InMemoryRepository;
pub use traits::{
    DatastoreError, Repository, Result, TransactionOrder, TransactionQuery, WriteBatch, WriteOp,
};
