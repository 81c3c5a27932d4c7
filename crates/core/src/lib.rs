pub mod conflict;
pub mod counting;
pub mod quota;
pub mod rules;
pub mod types;
