//! moorlock coordinates exclusive and shared leases on resources living
//! on storage that a set of hosts share without a network between them.
//! Host liveness is proven by delta leases (timestamped heartbeats in
//! per-host sectors), mutual exclusion by disk Paxos over per-resource
//! lease areas, and safety by an external watchdog that resets any host
//! whose renewal loop stalls.
//!
//! The workspace splits along concerns; this crate re-exports the public
//! surface:
//!
//! - [`types`]: names, flags, timeouts, clocks, request/dump structures
//! - [`error`]: the [`MoorError`] taxonomy
//! - [`io`]: aligned timeout-bounded sector I/O and disk backends
//! - [`ondisk`]: leader/dblock/mode/request record codecs
//! - [`delta`]: the host-liveness lease engine
//! - [`paxos`]: the resource lease engine
//! - [`runtime`]: lockspaces, tokens, clients, supervisor

pub use moorlock_delta as delta;
pub use moorlock_error as error;
pub use moorlock_io as io;
pub use moorlock_ondisk as ondisk;
pub use moorlock_paxos as paxos;
pub use moorlock_runtime as runtime;
pub use moorlock_types as types;

pub use moorlock_error::{MoorError, Result};
pub use moorlock_paxos::{HostInfoSource, PaxosEngine, Token};
pub use moorlock_runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use moorlock_types::{AcquireFlags, DiskSpec, LockspaceSpec, Name, ResourceSpec};
