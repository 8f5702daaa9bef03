//! Core types shared by every DeedVault crate.
//!
//! Identifiers are UUID newtypes so a `UserId` can never be passed where an
//! `ItemId` is expected. Everything that the deed application used to
//! dispatch on by string (`"deed_item"`, `"entry"`, ...) is a closed enum
//! here, so every match over it is checked exhaustively at build time.

mod access;
mod id;

pub use access::{AccessAction, DataClass, ParseEnumError, Permission, RelationStatus};
pub use id::{ItemId, RelationId, UserId};
