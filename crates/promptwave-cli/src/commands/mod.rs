pub mod plan;
pub mod rules;
pub mod triggers;
