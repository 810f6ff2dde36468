//! Lifecycle and document consolidation engine for remisiones (work orders).
//!
//! [`state_machine`] governs the workflow, [`document`] turns a remisión's
//! attachments into one canonically ordered PDF and [`orchestrator`] ties both
//! to a [`repository`] and an attachment [`store`].

pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod orchestrator;
pub mod repository;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod validation;
