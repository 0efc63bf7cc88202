pub mod auth;
pub mod instances;
pub mod internal;
pub mod ops;
