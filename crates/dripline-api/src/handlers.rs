//! Request handlers

pub mod campaigns;
pub mod health;
pub mod jobs;
pub mod quota;
pub mod steps;
