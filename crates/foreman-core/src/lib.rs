//! Core data model and algorithms for the foreman CI task scheduler.
//!
//! This crate is pure data + logic: tasks, jobs, task-spec documents, the
//! in-memory commit graph, the sliding commit window, the blacklist, and
//! the testedness scoring functions. Nothing here depends on an async
//! runtime or a database — those live in `foreman-db` and
//! `foreman-scheduler`.

pub mod blacklist;
pub mod config;
pub mod event;
pub mod job;
pub mod repograph;
pub mod score;
pub mod spec;
pub mod task;
pub mod window;
