//! Domain bookkeeping for PortMux.
//!
//! This module contains pure registry logic with no infrastructure
//! dependencies: no sockets, no async runtime, no locks.  The engine layer
//! owns a [`connections::ConnectionTable`] behind a single mutex and is the
//! only place that decides *when* to mutate it; this module only decides
//! *how* identifiers are allocated, grown, and released.

/// Connection-identifier registry, the core domain concept.
///
/// See [`connections::ConnectionTable`] for the main type.
pub mod connections;
