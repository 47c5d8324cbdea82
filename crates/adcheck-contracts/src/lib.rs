pub mod categories;
pub mod events;
pub mod outcomes;
pub mod report;
pub mod rules;
