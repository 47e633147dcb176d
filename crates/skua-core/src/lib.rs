//! # Skua Core
//!
//! Shared domain types for the skua FTP daemon: users, groups, principals,
//! file ownership records, and the repository traits implemented by the
//! persistence layer.

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::{GroupStore, NewUser, UserField, UserStore};
pub use types::{
    flag, Group, GroupId, Owner, Principal, TransferDirection, User, UserId, DEFAULT_SECTION,
    UNKNOWN_NAME,
};
