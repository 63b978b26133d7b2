pub mod approval;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod gating;
pub mod metrics;
pub mod policy;
pub mod proposals;
pub mod session;
pub mod signals;
