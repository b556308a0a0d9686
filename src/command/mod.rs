pub mod args;
pub mod build;
pub mod info;
