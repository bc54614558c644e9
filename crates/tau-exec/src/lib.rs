//! Request-triggered external command execution with detached, collected, and
//! streamed delivery.
pub mod argument_resolver;
pub mod command_descriptor;
pub mod dispatcher;
pub mod exec_error;
pub mod process_registry;
pub mod process_runner;
pub mod response_encoder;
pub mod stream_sink;

pub use argument_resolver::*;
pub use command_descriptor::*;
pub use dispatcher::*;
pub use exec_error::*;
pub use process_registry::*;
pub use process_runner::*;
pub use response_encoder::*;
pub use stream_sink::*;
