//! Command metadata: subsystems, commands, parameter types and enumerations.
//!
//! - [`Registry`] resolves names and ids once; lookups hand out shared
//!   [`CommandDef`]s
//! - [`ParamType`] is the closed set of semantic types the codec handles

mod params;
mod registry;

pub use params::{Param, ParamType};
pub use registry::{CommandDef, Ident, Registry, SubsystemDef};
