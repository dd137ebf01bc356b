pub mod deployments;
pub mod health;
pub mod readiness;
