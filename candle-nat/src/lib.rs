//! Non-autoregressive translation models built on candle.
//!
//! The [`models::nat_sd`] module holds the self-conditioned NAT decoder together
//! with its CTC and glancing-training variants.

pub mod models;
