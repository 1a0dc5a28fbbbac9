//! HTTP/1.x front end.
//!
//! # Data Flow
//! ```text
//! Readable client socket
//!     → request.rs (request line, path sanitising, header block)
//!     → [route table picks the application]
//!     → worker::http (serves the backend's operations)
//!     → response.rs (buffered head, keep-alive decision, error pages)
//!     → client socket
//! ```

pub mod request;
pub mod response;

pub use request::{read_request_head, redirect_location, split_host_port, HeadError, RequestHead};
pub use response::{client_wants_keep_alive, ConnectionPolicy, ResponseHead};
