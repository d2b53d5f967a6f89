//! A2DP sink session.
//!
//! The [`machine`] decides, the other modules act on the stack through the
//! collaborator traits in [`crate::bluetooth::stack`].

pub mod adapter;
pub mod discovery;
pub mod dispatcher;
pub mod machine;
pub mod profiles;
pub mod proxy;
pub mod session;
