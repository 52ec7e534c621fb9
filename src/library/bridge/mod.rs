//! Glue between the engine's requests and the reactor's registrations.

pub mod registrations;
pub mod timer;
