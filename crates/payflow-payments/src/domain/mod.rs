//! Domain model: entities, events, commands and repository contracts.

pub mod aggregates;
pub mod commands;
pub mod events;
pub mod repository;
