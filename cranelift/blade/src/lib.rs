//! Spectre mitigation by minimal fence placement.
//!
//! The pass finds the loads whose results may be controlled by a
//! mispredicted branch, follows their values to the instructions that leak
//! them through the cache or branch predictor, and cuts every such flow
//! with as few fences as a weighted minimum cut allows. See `blade` for the
//! driver.

#![warn(missing_docs)]
#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

/// Trace-level logging, compiled out of release builds unless the
/// `trace-log` feature is on.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}

pub mod alias;
pub mod blade;
pub mod def_use;
pub mod graph;
pub mod inst_predicates;
pub mod intrinsics;
pub mod leak;
pub mod mincut;
pub mod placement;
pub mod policy;
pub mod result;
pub mod settings;
pub mod taint;
pub mod weights;

pub use crate::blade::{do_blade, BladeStats};
pub use crate::intrinsics::{Intrinsic, Intrinsics};
pub use crate::leak::LeakClassifier;
pub use crate::mincut::{run_mincut, CancelFlag, CutEdge, MincutStrategy, WaypointGroup};
pub use crate::placement::{place_mitigations, InsertionPoint, Mitigation};
pub use crate::result::{BladeError, BladeResult};
pub use crate::taint::{compute_taint, TaintMap, ThreatModel};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
