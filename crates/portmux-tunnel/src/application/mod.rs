//! Application layer: the tunnel supervisor that owns sessions and reports
//! lifecycle events to the host.

pub mod tunnel;
