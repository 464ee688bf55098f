//! Request/reply and publish transport over framed TCP.
//!
//! The server and client only correlate envelopes; [`Gateway`] gives the
//! payloads their meaning.

pub mod client;
pub mod gateway;
pub mod server;

pub use client::TransportClient;
pub use gateway::{ApiRequest, Gateway, HealthReport, ScaleResponse, TranslateResponse};
pub use server::{RequestHandler, TransportServer};
