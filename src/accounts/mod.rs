// src/accounts/mod.rs
pub mod registry;
pub mod store;

pub use registry::{AccountHandle, AccountRegistry, PrimaryAccount};
pub use store::{Account, AccountStore, AccountUpdate, AccountView, NewAccount};
