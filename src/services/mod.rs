pub mod assets;
pub mod backend;
pub mod dispatcher;
pub mod encryption;
pub mod moderation;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod storage;
