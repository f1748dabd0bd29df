pub mod connect;
pub mod rewrite;
