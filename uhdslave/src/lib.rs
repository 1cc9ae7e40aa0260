// uhdslave/src/lib.rs
//
// UHD media-slave — access-control gateway agent.
//
// The transport layer (nginx/any reverse proxy front) is an external
// collaborator: it hands each request to `engine::AccessPipeline::evaluate`
// before forwarding, applies the returned decision, and calls
// `log_phase::LogPhase::record` after the response has been sent.
// Everything else — identity resolution, policy state, control-plane
// synchronisation — lives here.

pub mod agent;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod engine;
pub mod health;
pub mod identity;
pub mod log_phase;
pub mod login_capture;
pub mod state;
pub mod store;
pub mod types;
pub mod upstream;
