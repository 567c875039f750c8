//! I/O layer - process supervision and the raw stdio channel
//!
//! - **Transport**: moves text to and from the server without framing
//! - **Process**: spawns the server, drains stderr, reports exit
//!
//! Nothing here knows about JSON-RPC or LSP.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, StdioTransport, StdioTransportError, Transport};
