// src/model/mod.rs

pub mod dag;
pub mod task;

pub use dag::Dag;
pub use task::{
    task_signature, ErrorKind, Parameters, Task, TaskOutcome, TaskStatus,
};
