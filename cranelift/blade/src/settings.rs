//! Blade settings.
//!
//! Settings are configured through a `Builder` with string names and
//! values, then frozen into an immutable `Flags` object with typed
//! accessors:
//!
//! ```
//! use cranelift_blade::settings::{self, Configurable};
//!
//! let mut b = settings::builder();
//! b.set("blade_type", "lfence_per_block").unwrap();
//! b.enable("branch_waypoints").unwrap();
//! let flags = settings::Flags::new(b);
//! assert_eq!(flags.blade_type(), settings::BladeType::LfencePerBlock);
//! assert!(flags.branch_waypoints());
//! ```

use core::fmt;
use core::str::FromStr;
use thiserror::Error;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// An error produced when changing a setting.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetError {
    /// No setting by this name exists.
    #[error("No existing setting named '{0}'")]
    BadName(String),

    /// Type mismatch for setting (e.g., setting an enum setting as a bool).
    #[error("Trying to set a setting with the wrong type")]
    BadType,

    /// This is not a valid value for this setting.
    #[error("Unexpected value for a setting, expected {0}")]
    BadValue(String),
}

/// A result returned when changing a setting.
pub type SetResult<T> = Result<T, SetError>;

/// Interface for setting flags by name.
pub trait Configurable {
    /// Set the string value of any setting by name.
    ///
    /// This can set any type of setting whether it is numeric, boolean, or
    /// enumerated.
    fn set(&mut self, name: &str, value: &str) -> SetResult<()>;

    /// Enable a boolean setting.
    fn enable(&mut self, name: &str) -> SetResult<()>;
}

/// Which mitigation the pass applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum BladeType {
    /// Leave functions untouched.
    None,
    /// Minimum cut, one fence per cut edge.
    Lfence,
    /// Minimum cut, one fence at the top of the linear block holding each
    /// cut edge's destination.
    LfencePerBlock,
    /// No cut: a fence right after every source load that may leak.
    BaselineFence,
}

/// How waypoint groups are separated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum MincutStrategy {
    /// Iterated per-group max-flow.
    Combinatorial,
    /// Exact solution of the label-set formulation.
    Constraint,
}

macro_rules! enum_setting {
    ($ty:ident { $($name:literal => $variant:ident),* $(,)? }) => {
        impl $ty {
            fn values() -> &'static str {
                concat!($($name, " "),*).trim_end()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(match *self {
                    $(Self::$variant => $name,)*
                })
            }
        }

        impl FromStr for $ty {
            type Err = ();
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    _ => Err(()),
                }
            }
        }
    };
}

enum_setting!(BladeType {
    "none" => None,
    "lfence" => Lfence,
    "lfence_per_block" => LfencePerBlock,
    "baseline_fence" => BaselineFence,
});

enum_setting!(MincutStrategy {
    "combinatorial" => Combinatorial,
    "constraint" => Constraint,
});

/// Collect settings before freezing them into `Flags`.
#[derive(Clone, Debug)]
pub struct Builder {
    flags: Flags,
}

/// Create a new builder with all settings at their defaults.
pub fn builder() -> Builder {
    Builder {
        flags: Flags::default(),
    }
}

fn parse_bool(value: &str) -> SetResult<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(SetError::BadValue("bool".to_string())),
    }
}

fn parse_num(value: &str) -> SetResult<u64> {
    value
        .parse()
        .map_err(|_| SetError::BadValue("number".to_string()))
}

fn parse_enum<T: FromStr>(value: &str, values: &str) -> SetResult<T> {
    value
        .parse()
        .map_err(|_| SetError::BadValue(format!("one of {}", values)))
}

impl Configurable for Builder {
    fn set(&mut self, name: &str, value: &str) -> SetResult<()> {
        let f = &mut self.flags;
        match name {
            "blade_type" => f.blade_type = parse_enum(value, BladeType::values())?,
            "mincut_strategy" => {
                f.mincut_strategy = parse_enum(value, MincutStrategy::values())?
            }
            "pseudo_transmitters" => f.pseudo_transmitters = parse_bool(value)?,
            "branch_waypoints" => f.branch_waypoints = parse_bool(value)?,
            "prune_public_transmissions" => f.prune_public_transmissions = parse_bool(value)?,
            "base_edge_weight" => f.base_edge_weight = parse_num(value)?,
            "max_mincut_passes" => f.max_mincut_passes = parse_num(value)?,
            "constraint_search_budget" => f.constraint_search_budget = parse_num(value)?,
            "smt_timeout_ms" => f.smt_timeout_ms = parse_num(value)?,
            _ => return Err(SetError::BadName(name.to_string())),
        }
        Ok(())
    }

    fn enable(&mut self, name: &str) -> SetResult<()> {
        let f = &mut self.flags;
        match name {
            "pseudo_transmitters" => f.pseudo_transmitters = true,
            "branch_waypoints" => f.branch_waypoints = true,
            "prune_public_transmissions" => f.prune_public_transmissions = true,
            "blade_type" | "mincut_strategy" | "base_edge_weight" | "max_mincut_passes"
            | "constraint_search_budget" | "smt_timeout_ms" => return Err(SetError::BadType),
            _ => return Err(SetError::BadName(name.to_string())),
        }
        Ok(())
    }
}

/// Frozen settings.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Flags {
    blade_type: BladeType,
    mincut_strategy: MincutStrategy,
    pseudo_transmitters: bool,
    branch_waypoints: bool,
    prune_public_transmissions: bool,
    base_edge_weight: u64,
    max_mincut_passes: u64,
    constraint_search_budget: u64,
    smt_timeout_ms: u64,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            blade_type: BladeType::Lfence,
            mincut_strategy: MincutStrategy::Combinatorial,
            pseudo_transmitters: true,
            branch_waypoints: false,
            prune_public_transmissions: false,
            base_edge_weight: 1000,
            max_mincut_passes: 64,
            constraint_search_budget: 100_000,
            smt_timeout_ms: 0,
        }
    }
}

impl Flags {
    /// Freeze the settings collected by `builder`.
    pub fn new(builder: Builder) -> Self {
        builder.flags
    }

    /// Which mitigation to apply.
    pub fn blade_type(&self) -> BladeType {
        self.blade_type
    }

    /// How to compute the cut.
    pub fn mincut_strategy(&self) -> MincutStrategy {
        self.mincut_strategy
    }

    /// Whether pseudo-transmitter operands are sinks too.
    pub fn pseudo_transmitters(&self) -> bool {
        self.pseudo_transmitters
    }

    /// Whether groups must pass through a conditional branch between
    /// source and sink.
    pub fn branch_waypoints(&self) -> bool {
        self.branch_waypoints
    }

    /// Whether to skip transmissions of values that leak architecturally.
    pub fn prune_public_transmissions(&self) -> bool {
        self.prune_public_transmissions
    }

    /// Base of the edge weight estimate.
    pub fn base_edge_weight(&self) -> u64 {
        self.base_edge_weight
    }

    /// Pass limit of the combinatorial strategy.
    pub fn max_mincut_passes(&self) -> u64 {
        self.max_mincut_passes
    }

    /// Search node limit of the branch-and-bound backend.
    pub fn constraint_search_budget(&self) -> u64 {
        self.constraint_search_budget
    }

    /// Z3 timeout in milliseconds, 0 for none.
    pub fn smt_timeout_ms(&self) -> u64 {
        self.smt_timeout_ms
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "[blade]")?;
        writeln!(f, "blade_type = \"{}\"", self.blade_type)?;
        writeln!(f, "mincut_strategy = \"{}\"", self.mincut_strategy)?;
        writeln!(f, "pseudo_transmitters = {}", self.pseudo_transmitters)?;
        writeln!(f, "branch_waypoints = {}", self.branch_waypoints)?;
        writeln!(f, "prune_public_transmissions = {}", self.prune_public_transmissions)?;
        writeln!(f, "base_edge_weight = {}", self.base_edge_weight)?;
        writeln!(f, "max_mincut_passes = {}", self.max_mincut_passes)?;
        writeln!(f, "constraint_search_budget = {}", self.constraint_search_budget)?;
        writeln!(f, "smt_timeout_ms = {}", self.smt_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_default() {
        let f = Flags::new(builder());
        assert_eq!(
            f.to_string(),
            r#"[blade]
blade_type = "lfence"
mincut_strategy = "combinatorial"
pseudo_transmitters = true
branch_waypoints = false
prune_public_transmissions = false
base_edge_weight = 1000
max_mincut_passes = 64
constraint_search_budget = 100000
smt_timeout_ms = 0
"#
        );
    }

    #[test]
    fn modify_settings() {
        let mut b = builder();
        assert_eq!(b.enable("not_there"), Err(SetError::BadName("not_there".to_string())));
        assert_eq!(b.enable("blade_type"), Err(SetError::BadType));
        assert_eq!(
            b.set("blade_type", "slh"),
            Err(SetError::BadValue(
                "one of none lfence lfence_per_block baseline_fence".to_string()
            ))
        );
        assert_eq!(
            b.set("pseudo_transmitters", "maybe"),
            Err(SetError::BadValue("bool".to_string()))
        );
        assert_eq!(b.set("mincut_strategy", "constraint"), Ok(()));
        assert_eq!(b.set("pseudo_transmitters", "off"), Ok(()));
        assert_eq!(b.set("base_edge_weight", "10"), Ok(()));
        assert_eq!(b.enable("prune_public_transmissions"), Ok(()));

        let f = Flags::new(b);
        assert_eq!(f.mincut_strategy(), MincutStrategy::Constraint);
        assert!(!f.pseudo_transmitters());
        assert!(f.prune_public_transmissions());
        assert_eq!(f.base_edge_weight(), 10);
        assert_eq!(f.blade_type(), BladeType::Lfence);
    }
}
