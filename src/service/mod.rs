pub mod client;
pub mod facade;
pub mod orchestrator;
pub mod protocol;

pub use client::ServiceClient;
pub use facade::RecognitionService;
pub use orchestrator::Orchestrator;
