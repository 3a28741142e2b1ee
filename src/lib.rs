pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{ErrorKind, MalformedIdError, MbeeError, MbeeResult};

pub use logic::{
    to_jmi1, to_jmi2, to_jmi3, BranchAction, BranchGuard, BranchOperations, ElementController,
    JmiTree, Validator,
};

// Export all model types
pub use model::*;

pub use seed::load_seed_data;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};
