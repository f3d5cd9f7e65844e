//! Utilities for running nodes in tests without real sockets. They are used for testing this
//!  crate's functionality, but they are also exported so applications can test their own code
//!  against a simulated cluster.

pub mod in_memory_transport;
