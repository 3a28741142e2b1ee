pub mod branch_guard;
pub mod branch_ops;
pub mod bulk;
pub mod element_ops;
pub mod jmi;
pub mod validate;

pub use branch_guard::*;
pub use branch_ops::*;
pub use element_ops::*;
pub use jmi::*;
pub use validate::*;
