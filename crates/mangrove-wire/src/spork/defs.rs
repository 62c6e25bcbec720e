//! Compile-time spork definitions.

use tracing::debug;

/// Sentinel returned for an unknown spork name.
pub const SPORK_INVALID: i32 = -1;

/// Default for sporks that ship disabled: a timestamp far enough in the
/// future (year 2099) that the value never compares as active.
pub const SPORK_OFF: i64 = 4_070_908_800;

/// One parameter slot the network knows about.
#[derive(Debug, Clone, Copy)]
pub struct SporkDef {
    pub spork_id: i32,
    pub name: &'static str,
    pub default_value: i64,
}

/// Every defined spork and the value it has before any signer speaks.
pub const SPORK_DEFS: &[SporkDef] = &[
    SporkDef {
        spork_id: 10001,
        name: "SPORK_2_INSTANTSEND_ENABLED",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10002,
        name: "SPORK_3_INSTANTSEND_BLOCK_FILTERING",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10008,
        name: "SPORK_9_SUPERBLOCKS_ENABLED",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10016,
        name: "SPORK_17_QUORUM_DKG_ENABLED",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10018,
        name: "SPORK_19_CHAINLOCKS_ENABLED",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10020,
        name: "SPORK_21_QUORUM_ALL_CONNECTED",
        default_value: SPORK_OFF,
    },
    SporkDef {
        spork_id: 10022,
        name: "SPORK_23_QUORUM_POSE",
        default_value: SPORK_OFF,
    },
];

/// Looks up a spork definition by id.
pub fn spork_def(spork_id: i32) -> Option<&'static SporkDef> {
    SPORK_DEFS.iter().find(|def| def.spork_id == spork_id)
}

/// Resolves a spork name to its id, or [`SPORK_INVALID`] if unknown.
pub fn spork_id_by_name(name: &str) -> i32 {
    match SPORK_DEFS.iter().find(|def| def.name == name) {
        Some(def) => def.spork_id,
        None => {
            debug!("spork_id_by_name -- unknown spork name '{name}'");
            SPORK_INVALID
        }
    }
}

/// Resolves a spork id to its name, if defined.
pub fn spork_name_by_id(spork_id: i32) -> Option<&'static str> {
    spork_def(spork_id).map(|def| def.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_lookup() {
        assert_eq!(spork_id_by_name("SPORK_17_QUORUM_DKG_ENABLED"), 10016);
        assert_eq!(spork_name_by_id(10016), Some("SPORK_17_QUORUM_DKG_ENABLED"));
        assert_eq!(spork_id_by_name("SPORK_999_NO_SUCH_THING"), SPORK_INVALID);
        assert_eq!(spork_name_by_id(SPORK_INVALID), None);
    }

    #[test]
    fn test_defs_are_unique() {
        for (i, def) in SPORK_DEFS.iter().enumerate() {
            for other in &SPORK_DEFS[i + 1..] {
                assert_ne!(def.spork_id, other.spork_id);
                assert_ne!(def.name, other.name);
            }
        }
    }
}
