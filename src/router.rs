//! Maps absolute guest paths to routing decisions.
//!
//! Normalization is purely lexical: `.` and `..` resolve against the root,
//! never escaping above `/`, in a fixed-size buffer (overflow is
//! ENAMETOOLONG). Matching is directory-aware: `/tmp` matches `/tmp` and
//! `/tmp/...` but not `/tmpfoo`.

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

pub const PATH_MAX: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hard-deny.
    Block,
    /// Copy-on-write overlay over the host filesystem.
    Cow,
    /// Private per-sandbox /tmp.
    Tmp,
    /// Virtualized /proc.
    Proc,
    /// Host device passthrough.
    Device,
}

struct Node {
    /// Decision when the walk ends exactly here.
    route: Option<Route>,
    /// Decision for descendants with no more specific match.
    default: Option<Route>,
    children: Vec<(&'static str, Node)>,
}

impl Node {
    fn leaf(route: Route) -> Node {
        Node {
            route: Some(route),
            default: Some(route),
            children: Vec::new(),
        }
    }

    fn branch(
        route: Option<Route>,
        default: Option<Route>,
        children: Vec<(&'static str, Node)>,
    ) -> Node {
        Node {
            route,
            default,
            children,
        }
    }
}

static RULES: Lazy<Node> = Lazy::new(|| {
    Node::branch(
        Some(Route::Cow),
        Some(Route::Cow),
        vec![
            ("sys", Node::leaf(Route::Block)),
            ("run", Node::leaf(Route::Block)),
            (
                "dev",
                Node::branch(
                    Some(Route::Block),
                    Some(Route::Block),
                    vec![
                        ("null", Node::leaf(Route::Device)),
                        ("zero", Node::leaf(Route::Device)),
                        ("random", Node::leaf(Route::Device)),
                        ("urandom", Node::leaf(Route::Device)),
                    ],
                ),
            ),
            ("proc", Node::leaf(Route::Proc)),
            (
                "tmp",
                Node::branch(
                    Some(Route::Tmp),
                    Some(Route::Tmp),
                    vec![(".bvisor", Node::leaf(Route::Block))],
                ),
            ),
        ],
    )
});

/// Lexically normalizes an absolute path. `..` at the root stays at the
/// root; trailing slashes and empty components are dropped.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath);
    }
    if path.len() >= PATH_MAX {
        return Err(Error::BufferTooSmall);
    }

    let mut buf = [0u8; PATH_MAX];
    let mut len = 0usize;
    // byte offsets of each '/' starting a component, for `..` pops
    let mut seg_starts: Vec<usize> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if let Some(start) = seg_starts.pop() {
                    len = start;
                }
            }
            name => {
                if len + 1 + name.len() >= PATH_MAX {
                    return Err(Error::BufferTooSmall);
                }
                seg_starts.push(len);
                buf[len] = b'/';
                buf[len + 1..len + 1 + name.len()].copy_from_slice(name.as_bytes());
                len += 1 + name.len();
            }
        }
    }

    if len == 0 {
        return Ok("/".to_string());
    }
    // input was valid UTF-8 and we only copied whole components
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Routes an arbitrary path: normalize, then walk the prefix tree.
pub fn resolve(path: &str) -> Result<Route> {
    let norm = normalize(path)?;
    Ok(resolve_normalized(&norm))
}

/// Routes an already-normalized absolute path.
pub fn resolve_normalized(path: &str) -> Route {
    let mut node = &*RULES;
    let mut fallback = node.default.expect("root rule has a default");

    for comp in path.split('/').filter(|c| !c.is_empty()) {
        match node.children.iter().find(|(name, _)| *name == comp) {
            Some((_, child)) => {
                if let Some(d) = child.default {
                    fallback = d;
                }
                node = child;
            }
            None => return fallback,
        }
    }
    node.route.unwrap_or(fallback)
}
