//! In-memory engine
//!
//! Objects live in sparse page stores inside the state of their home
//! shard; collections keep their object maps on their own home shard.
//! Handles are cheap to clone and can be used from any thread.

mod collection;
mod object;
mod pages;
mod state;
mod store;

pub use collection::MemCollection;
pub use object::MemObject;
pub use pages::{DataSegments, ExtentMap, PageStore};
pub use state::MAX_READ_LEN;
pub use store::MemStore;
