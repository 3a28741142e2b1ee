pub mod common;
pub mod database;
pub mod element;
pub mod filter;
pub mod record;
pub mod user_context;

pub use common::*;
pub use database::*;
pub use element::*;
pub use filter::*;
pub use record::*;
pub use user_context::*;
