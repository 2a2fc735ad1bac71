//! retcon-node: mesh link supervisor for RETCON store-and-forward nodes
//!
//! A node glues several radios into one network: a batman-adv Layer-2 mesh
//! over an IBSS radio, a managed WiFi client association to a neighbouring
//! node's access point, and a Bluetooth PAN access point for phones. Each of
//! these is a link with its own recovery state machine:
//!
//! ```text
//! Unconfigured -> Initializing -> Running <-> Degraded -> Failed
//! ```
//!
//! The [`Supervisor`] ticks every link on a fixed interval, probes its
//! health, and retries setup within a bounded budget. Status snapshots are
//! built on demand for external observers.

pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod identity;
pub mod link;
pub mod netinfo;
pub mod peer;
pub mod probe;
pub mod process;
pub mod radio;
pub mod status;
pub mod supervisor;

pub use config::{Config, NodeMode};
pub use error::{ConfigError, LinkError, ProcessError, SupervisorError};
pub use exec::{Cmd, CmdOutput, CommandRunner, DryRunRunner, SystemRunner};
pub use host::Host;
pub use link::{LinkConfig, LinkDriver, LinkKind, LinkState, RecoveryBudget};
pub use peer::{noop_restart_hook, RestartHook};
pub use process::{ProcessManager, ProcessSpec, RADIO_STACK};
pub use status::LinkStatus;
pub use supervisor::Supervisor;
