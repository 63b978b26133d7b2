pub mod health;
pub mod learning;
