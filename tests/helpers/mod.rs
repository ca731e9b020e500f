#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{NodeBuilder, PrincipalBuilder, RoleBuilder};
pub use db::TestDb;
