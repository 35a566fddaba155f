//! Copy-on-write views of cache trees

pub mod merge;
pub mod transaction;

pub use merge::{MergeStats, OverlayMerger};
pub use transaction::{
    create_strategy, mutation, FullCopy, Mutation, TransactionOutcome, TransactionStrategy,
    UnionMount, WorkingEnvironment,
};
