//! Read-only command metadata.
//!
//! The registry maps subsystem and command names to their wire ids, command
//! kind and ordered parameter lists. It is loaded once from a JSON definition
//! file and shared behind an `Arc` by every command object.
//!
//! # Definition format
//!
//! ```json
//! {
//!   "subsystems": { "SYS": 1 },
//!   "commands": {
//!     "SYS": {
//!       "ping": { "id": 1, "type": "SREQ", "req": [], "rsp": [["capabilities", "uint16"]] }
//!     }
//!   },
//!   "enums": { "status": { "SUCCESS": 0 } }
//! }
//! ```
//!
//! A command may set `"genericRsp": true` to accept the fixed
//! `srcaddr/status/nwkaddr/len` layout when its own layout does not fit.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::params::{Param, ParamType};
use crate::error::{Result, UnpiError};
use crate::protocol::{CmdType, SUBSYSTEM_MASK};

const BUILTIN_DEFINITIONS: &str = include_str!("defs/znp.json");

/// A subsystem or command given either by name or by wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ident<'a> {
    Name(&'a str),
    Id(u8),
}

impl<'a> From<&'a str> for Ident<'a> {
    fn from(name: &'a str) -> Self {
        Ident::Name(name)
    }
}

impl<'a> From<&'a String> for Ident<'a> {
    fn from(name: &'a String) -> Self {
        Ident::Name(name.as_str())
    }
}

impl From<u8> for Ident<'_> {
    fn from(id: u8) -> Self {
        Ident::Id(id)
    }
}

impl fmt::Display for Ident<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Name(name) => f.write_str(name),
            Ident::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Static description of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDef {
    pub id: u8,
    pub name: String,
    pub cmd_type: CmdType,
    /// Request parameters; also the layout of AREQ notifications.
    pub req: Vec<Param>,
    /// Synchronous response parameters.
    pub rsp: Vec<Param>,
    /// Accept the generic response layout as a parse fallback.
    pub generic_rsp: bool,
}

impl CommandDef {
    /// Parameters describing a payload of the given kind.
    pub fn params_for(&self, kind: CmdType) -> Result<&[Param]> {
        match kind {
            CmdType::Srsp => Ok(&self.rsp),
            CmdType::Areq => Ok(&self.req),
            other => Err(UnpiError::Parse(format!(
                "Unrecognized type {} for {}",
                other, self.name
            ))),
        }
    }
}

/// A subsystem and the commands it carries.
#[derive(Debug)]
pub struct SubsystemDef {
    pub id: u8,
    pub name: String,
    commands: Vec<Arc<CommandDef>>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u8, usize>,
}

impl SubsystemDef {
    /// Look up a command by name or id.
    pub fn command(&self, ident: Ident<'_>) -> Option<&Arc<CommandDef>> {
        let idx = match ident {
            Ident::Name(name) => self.by_name.get(name),
            Ident::Id(id) => self.by_id.get(&id),
        }?;
        self.commands.get(*idx)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Arc<CommandDef>> {
        self.commands.iter()
    }
}

#[derive(Debug, Default)]
struct Enumeration {
    by_value: BTreeMap<i64, String>,
    by_name: HashMap<String, i64>,
}

#[derive(Deserialize)]
struct RawDefinitions {
    subsystems: BTreeMap<String, u8>,
    #[serde(default)]
    commands: BTreeMap<String, BTreeMap<String, RawCommand>>,
    #[serde(default)]
    enums: BTreeMap<String, BTreeMap<String, i64>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    id: u8,
    #[serde(rename = "type")]
    cmd_type: String,
    #[serde(default)]
    req: Vec<(String, String)>,
    #[serde(default)]
    rsp: Vec<(String, String)>,
    #[serde(default)]
    generic_rsp: bool,
}

/// Registry of subsystems, commands and enumerations.
#[derive(Debug)]
pub struct Registry {
    subsystems: Vec<SubsystemDef>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u8, usize>,
    enums: HashMap<String, Enumeration>,
}

impl Registry {
    /// Load the bundled Z-Stack definitions.
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_DEFINITIONS)
    }

    /// Load definitions from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Load definitions from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawDefinitions = serde_json::from_str(json)?;
        Self::build(raw)
    }

    fn build(raw: RawDefinitions) -> Result<Self> {
        let mut registry = Registry {
            subsystems: Vec::with_capacity(raw.subsystems.len()),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            enums: HashMap::new(),
        };

        for (name, id) in raw.subsystems {
            if id > SUBSYSTEM_MASK {
                return Err(UnpiError::Definition(format!(
                    "subsystem {} id {} does not fit in 5 bits",
                    name, id
                )));
            }
            if registry.by_id.contains_key(&id) {
                return Err(UnpiError::Definition(format!(
                    "subsystem id {} defined twice",
                    id
                )));
            }
            let idx = registry.subsystems.len();
            registry.by_name.insert(name.clone(), idx);
            registry.by_id.insert(id, idx);
            registry.subsystems.push(SubsystemDef {
                id,
                name,
                commands: Vec::new(),
                by_name: HashMap::new(),
                by_id: HashMap::new(),
            });
        }

        for (subsys_name, commands) in raw.commands {
            let idx = *registry.by_name.get(&subsys_name).ok_or_else(|| {
                UnpiError::Definition(format!("commands for unknown subsystem {}", subsys_name))
            })?;
            let subsystem = &mut registry.subsystems[idx];

            for (name, cmd) in commands {
                let cmd_type = CmdType::from_name(&cmd.cmd_type).ok_or_else(|| {
                    UnpiError::Definition(format!(
                        "{}:{} has unknown type {}",
                        subsys_name, name, cmd.cmd_type
                    ))
                })?;
                if subsystem.by_id.contains_key(&cmd.id) {
                    return Err(UnpiError::Definition(format!(
                        "{} command id {} defined twice",
                        subsys_name, cmd.id
                    )));
                }

                let def = CommandDef {
                    id: cmd.id,
                    name: name.clone(),
                    cmd_type,
                    req: convert_params(cmd.req)?,
                    rsp: convert_params(cmd.rsp)?,
                    generic_rsp: cmd.generic_rsp,
                };
                let cmd_idx = subsystem.commands.len();
                subsystem.by_name.insert(name, cmd_idx);
                subsystem.by_id.insert(cmd.id, cmd_idx);
                subsystem.commands.push(Arc::new(def));
            }
        }

        for (name, values) in raw.enums {
            let mut enumeration = Enumeration::default();
            for (key, value) in values {
                enumeration.by_value.entry(value).or_insert_with(|| key.clone());
                enumeration.by_name.insert(key, value);
            }
            registry.enums.insert(name, enumeration);
        }

        Ok(registry)
    }

    /// Resolve a subsystem by name or id.
    pub fn lookup_subsystem<'a>(&self, ident: impl Into<Ident<'a>>) -> Result<&SubsystemDef> {
        let ident = ident.into();
        let idx = match ident {
            Ident::Name(name) => self.by_name.get(name),
            Ident::Id(id) => self.by_id.get(&id),
        };
        idx.and_then(|i| self.subsystems.get(*i))
            .ok_or_else(|| UnpiError::UnrecognizedSubsystem(ident.to_string()))
    }

    /// Resolve a command within a subsystem.
    pub fn lookup_command<'a>(
        &self,
        subsystem: u8,
        command: impl Into<Ident<'a>>,
    ) -> Result<&Arc<CommandDef>> {
        let subsys = self.lookup_subsystem(subsystem)?;
        let command = command.into();
        subsys
            .command(command)
            .ok_or_else(|| UnpiError::UnrecognizedCommand {
                subsystem: subsys.name.clone(),
                command: command.to_string(),
            })
    }

    /// Request and response parameter lists of a command.
    pub fn params(&self, subsystem: u8, command: &str) -> Result<(&[Param], &[Param])> {
        let def = self.lookup_command(subsystem, command)?;
        Ok((&def.req, &def.rsp))
    }

    /// Symbolic name of an enumeration value.
    pub fn enum_name(&self, enumeration: &str, value: i64) -> Option<&str> {
        self.enums
            .get(enumeration)?
            .by_value
            .get(&value)
            .map(String::as_str)
    }

    /// Numeric value of an enumeration member.
    pub fn enum_value(&self, enumeration: &str, name: &str) -> Option<i64> {
        self.enums.get(enumeration)?.by_name.get(name).copied()
    }

    pub fn subsystems(&self) -> impl Iterator<Item = &SubsystemDef> {
        self.subsystems.iter()
    }
}

fn convert_params(raw: Vec<(String, String)>) -> Result<Vec<Param>> {
    raw.into_iter()
        .map(|(name, tag)| Ok(Param::new(name, tag.parse::<ParamType>()?)))
        .collect()
}
