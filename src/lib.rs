// Shared by the windowed renderer (`src/main.rs`) and the headless compute
// program (`src/bin/compute.rs`).

pub mod backend;
pub mod config;
pub mod drawable;
pub mod geometry;
pub mod renderer;
