//! Static role catalog: one ordered role ladder per hierarchy depth.
//!
//! Depth 1 is a lone CEO; deeper hierarchies insert management tiers between
//! the CEO and the worker layer. Non-root codes carry their depth suffix
//! (`VP7` is the VP tier of a 7-layer hierarchy), which is what makes every
//! non-root code globally unique across the table and lets a bare role code
//! identify the hierarchy it belongs to.

/// Deepest supported hierarchy.
pub const MAX_DEPTH: u8 = 16;

/// The root role code. Occurs at every depth, so reverse lookup excludes it.
pub const ROOT_ROLE: &str = "CEO";

/// Role ladders indexed by depth - 1. Position 0 is always the root role,
/// the last position is always the leaf role for that depth.
static HIERARCHIES: [&[&str]; MAX_DEPTH as usize] = [
    &["CEO"],
    &["CEO", "WKR2"],
    &["CEO", "VP3", "WKR3"],
    &["CEO", "VP4", "DIR4", "WKR4"],
    &["CEO", "VP5", "DIR5", "MGR5", "WKR5"],
    &["CEO", "VP6", "DIR6", "MGR6", "LEAD6", "WKR6"],
    &["CEO", "VP7", "DIR7", "MGR7", "LEAD7", "PRIN7", "WKR7"],
    &["CEO", "VP8", "DIR8", "MGR8", "LEAD8", "PRIN8", "STAFF8", "WKR8"],
    &[
        "CEO", "VP9", "DIR9", "MGR9", "LEAD9", "PRIN9", "STAFF9", "SR9", "WKR9",
    ],
    &[
        "CEO", "VP10", "DIR10", "MGR10", "LEAD10", "PRIN10", "STAFF10", "SR10", "ENG10", "WKR10",
    ],
    &[
        "CEO", "VP11", "DIR11", "MGR11", "LEAD11", "PRIN11", "STAFF11", "SR11", "ENG11", "DEV11",
        "WKR11",
    ],
    &[
        "CEO", "VP12", "DIR12", "MGR12", "LEAD12", "PRIN12", "STAFF12", "SR12", "ENG12", "DEV12",
        "ASSOC12", "WKR12",
    ],
    &[
        "CEO", "VP13", "DIR13", "MGR13", "LEAD13", "PRIN13", "STAFF13", "SR13", "ENG13", "DEV13",
        "ASSOC13", "TECH13", "WKR13",
    ],
    &[
        "CEO", "VP14", "DIR14", "MGR14", "LEAD14", "PRIN14", "STAFF14", "SR14", "ENG14", "DEV14",
        "ASSOC14", "TECH14", "OPS14", "WKR14",
    ],
    &[
        "CEO", "VP15", "DIR15", "MGR15", "LEAD15", "PRIN15", "STAFF15", "SR15", "ENG15", "DEV15",
        "ASSOC15", "TECH15", "OPS15", "COORD15", "WKR15",
    ],
    &[
        "CEO", "VP16", "DIR16", "MGR16", "LEAD16", "PRIN16", "STAFF16", "SR16", "ENG16", "DEV16",
        "ASSOC16", "TECH16", "OPS16", "COORD16", "SUP16", "WKR16",
    ],
];

/// The role ladder for a hierarchy depth (1..=16).
pub fn hierarchy(depth: u8) -> Option<&'static [&'static str]> {
    if depth == 0 || depth > MAX_DEPTH {
        return None;
    }
    Some(HIERARCHIES[depth as usize - 1])
}

/// The role code at a given depth and zero-based layer.
pub fn role_at(depth: u8, layer: u8) -> Option<&'static str> {
    hierarchy(depth)?.get(layer as usize).copied()
}

/// Reverse lookup: the unique `(depth, layer)` of a non-root role code.
///
/// The root role occurs identically at every depth and is intentionally
/// excluded; callers must disambiguate it from context.
pub fn locate(code: &str) -> Option<(u8, u8)> {
    if code == ROOT_ROLE {
        return None;
    }
    for (d, ladder) in HIERARCHIES.iter().enumerate() {
        for (l, role) in ladder.iter().enumerate() {
            if *role == code {
                return Some((d as u8 + 1, l as u8));
            }
        }
    }
    None
}

/// Whether a code appears anywhere in the catalog (root included).
pub fn is_known_role(code: &str) -> bool {
    code == ROOT_ROLE || locate(code).is_some()
}

/// Whether a role has subordinates to delegate to.
///
/// True when the role is not the last layer of its hierarchy. The root role
/// needs a known depth: a depth-1 CEO is its own worker.
pub fn can_delegate(code: &str, depth: Option<u8>) -> bool {
    if code == ROOT_ROLE {
        return depth.is_some_and(|d| d > 1 && d <= MAX_DEPTH);
    }
    match locate(code) {
        Some((d, layer)) => layer + 1 < d,
        None => false,
    }
}

/// The role one layer below `code` in its hierarchy, if any.
///
/// The root role is ambiguous without a depth; non-root codes ignore the
/// `depth` argument since they locate themselves.
pub fn subordinate_role(code: &str, depth: Option<u8>) -> Option<&'static str> {
    if code == ROOT_ROLE {
        return role_at(depth?, 1);
    }
    let (d, layer) = locate(code)?;
    role_at(d, layer + 1)
}

/// The role one layer above `code` in its hierarchy. `None` for the root.
pub fn parent_role(code: &str) -> Option<&'static str> {
    let (d, layer) = locate(code)?;
    if layer == 0 {
        return None;
    }
    role_at(d, layer - 1)
}
