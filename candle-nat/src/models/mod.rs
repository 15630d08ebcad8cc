pub mod nat_sd;
pub mod with_tracing;
