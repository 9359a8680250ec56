//! Text control messages accepted by a remap target.
//!
//! ```text
//! remap <sector>
//! load <main> <spare> <0|1>
//! clear
//! verify <sector>
//! status
//! sync
//! save
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::RemapError;
use crate::table::RemapEntry;

/// A parsed control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Remap a sector onto the next free spare sector
    Remap {
        /// Main-device sector
        sector: u64,
    },
    /// Insert a precomputed mapping
    Load {
        /// Main-device sector
        main_sector: u64,
        /// Spare-pool sector
        spare_sector: u64,
        /// Whether the data is known good
        valid: bool,
    },
    /// Drop every remap
    Clear,
    /// Report the mapping of one sector
    Verify {
        /// Main-device sector
        sector: u64,
    },
    /// Report table usage
    Status,
    /// Copy the table into metadata and save it
    Sync,
    /// Save metadata if dirty
    Save,
}

fn invalid(reason: impl Into<String>) -> RemapError {
    RemapError::InvalidCommand {
        reason: reason.into(),
    }
}

fn parse_sector(arg: Option<&str>, what: &str) -> Result<u64, RemapError> {
    let arg = arg.ok_or_else(|| invalid(format!("missing {}", what)))?;
    arg.parse::<u64>()
        .map_err(|e| invalid(format!("bad {} '{}': {}", what, arg, e)))
}

impl FromStr for ControlCommand {
    type Err = RemapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut args = s.split_whitespace();
        let verb = args.next().ok_or_else(|| invalid("empty message"))?;

        let cmd = match verb.to_ascii_lowercase().as_str() {
            "remap" => ControlCommand::Remap {
                sector: parse_sector(args.next(), "sector")?,
            },
            "load" => {
                let main_sector = parse_sector(args.next(), "main sector")?;
                let spare_sector = parse_sector(args.next(), "spare sector")?;
                let valid = match args.next() {
                    Some("0") => false,
                    Some("1") => true,
                    Some(other) => return Err(invalid(format!("bad valid flag '{}'", other))),
                    None => return Err(invalid("missing valid flag")),
                };
                ControlCommand::Load {
                    main_sector,
                    spare_sector,
                    valid,
                }
            }
            "clear" => ControlCommand::Clear,
            "verify" => ControlCommand::Verify {
                sector: parse_sector(args.next(), "sector")?,
            },
            "status" => ControlCommand::Status,
            "sync" => ControlCommand::Sync,
            "save" => ControlCommand::Save,
            other => return Err(invalid(format!("unknown command '{}'", other))),
        };

        if let Some(extra) = args.next() {
            return Err(invalid(format!("unexpected argument '{}'", extra)));
        }
        Ok(cmd)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Remap { sector } => write!(f, "remap {}", sector),
            ControlCommand::Load {
                main_sector,
                spare_sector,
                valid,
            } => write!(f, "load {} {} {}", main_sector, spare_sector, u8::from(*valid)),
            ControlCommand::Clear => write!(f, "clear"),
            ControlCommand::Verify { sector } => write!(f, "verify {}", sector),
            ControlCommand::Status => write!(f, "status"),
            ControlCommand::Sync => write!(f, "sync"),
            ControlCommand::Save => write!(f, "save"),
        }
    }
}

/// Reply to a `verify` message.
pub fn verify_reply(entry: Option<&RemapEntry>) -> String {
    match entry {
        Some(e) => format!("remapped to {} valid={}", e.spare_sector, u8::from(e.valid)),
        None => "not remapped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::SectorRange;
    use crate::table::RemapTable;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "remap 100".parse::<ControlCommand>().unwrap(),
            ControlCommand::Remap { sector: 100 }
        );
        assert_eq!(
            "  load 200 500 1 ".parse::<ControlCommand>().unwrap(),
            ControlCommand::Load {
                main_sector: 200,
                spare_sector: 500,
                valid: true
            }
        );
        assert_eq!("CLEAR".parse::<ControlCommand>().unwrap(), ControlCommand::Clear);
        assert_eq!(
            "verify 7".parse::<ControlCommand>().unwrap(),
            ControlCommand::Verify { sector: 7 }
        );
        assert_eq!("status".parse::<ControlCommand>().unwrap(), ControlCommand::Status);
        assert_eq!("sync".parse::<ControlCommand>().unwrap(), ControlCommand::Sync);
        assert_eq!("save".parse::<ControlCommand>().unwrap(), ControlCommand::Save);
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "remap",
            "remap -1",
            "remap x",
            "load 1 2",
            "load 1 2 yes",
            "verify 1 2",
            "format",
        ] {
            let err = bad.parse::<ControlCommand>().unwrap_err();
            assert!(matches!(err, RemapError::InvalidCommand { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_display_reparses() {
        let cmd = ControlCommand::Load {
            main_sector: 3,
            spare_sector: 9,
            valid: false,
        };
        assert_eq!(cmd.to_string(), "load 3 9 0");
        assert_eq!(cmd.to_string().parse::<ControlCommand>().unwrap(), cmd);
    }

    #[test]
    fn test_verify_reply() {
        let table = RemapTable::new(SectorRange::new(500, 4));
        table.load(200, 500, true).unwrap();
        assert_eq!(
            verify_reply(table.lookup(200).as_ref()),
            "remapped to 500 valid=1"
        );
        assert_eq!(verify_reply(table.lookup(201).as_ref()), "not remapped");
    }
}
