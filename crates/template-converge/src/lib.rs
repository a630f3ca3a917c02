pub mod acl;
pub mod backup;
pub mod checksum;
pub mod config;
pub mod converge;
pub mod error;
pub mod executor;
pub mod locator;
pub mod paths;
pub mod render;
pub mod resource;
pub mod runfile;

pub use converge::Converger;
pub use error::{Error, ErrorKind, Result};
pub use resource::{Action, ConvergenceResult, DesiredState, ObservedState};
