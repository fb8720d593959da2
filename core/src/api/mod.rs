// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP facade over the dispatcher.
//!
//! Translates the stable paths (`POST /submit_job`, `GET /job_status/{id}`,
//! `GET /cluster_status`, `POST /cancel_job/{id}`) plus the node-facing
//! control plane directly into dispatcher calls, and exposes `/ws` for
//! real-time cluster events.

pub mod error;
pub mod models;
pub mod rest;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use models::{ClusterStatusQuery, ErrorResponse, HealthResponse};
pub use rest::{router, serve};

/// API version advertised by the facade
pub const API_VERSION: &str = "v1";
