pub mod experiment;
pub mod health;
pub mod policy;
pub mod session;
