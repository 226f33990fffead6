//! Pure text reconciliation: detection, line merge, manual markers.

pub const MARKER_LOCAL: &str = "<<<<<<< local";
pub const MARKER_SPLIT: &str = "=======";
pub const MARKER_REMOTE: &str = ">>>>>>> remote";

/// Whether `local` and `remote` disagree in a way that needs resolving.
///
/// With a base, one-sided divergence is not a conflict: the unchanged
/// side simply adopts the other.
pub fn diverged(local: &str, remote: &str, base: Option<&str>) -> bool {
    if local == remote {
        return false;
    }
    match base {
        Some(base) => local != base && remote != base,
        None => true,
    }
}

/// Result of a line merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub content: String,
    /// 1-based lines changed differently on both sides. Local won them.
    pub collisions: Vec<usize>,
}

/// Three-way merge by line index.
///
/// Without a base the longer content wins, ties go to local.
pub fn merge(local: &str, remote: &str, base: Option<&str>) -> Merged {
    let Some(base) = base else {
        let content = if remote.len() > local.len() {
            remote
        } else {
            local
        };
        return Merged {
            content: content.to_owned(),
            collisions: Vec::new(),
        };
    };

    let local: Vec<&str> = local.split('\n').collect();
    let remote: Vec<&str> = remote.split('\n').collect();
    let base: Vec<&str> = base.split('\n').collect();
    let len = local.len().max(remote.len()).max(base.len());

    let mut lines = Vec::with_capacity(len);
    let mut collisions = Vec::new();
    for i in 0..len {
        let (l, r, b) = (local.get(i), remote.get(i), base.get(i));
        let pick = if l == r || r == b {
            l
        } else if l == b {
            r
        } else {
            collisions.push(i + 1);
            l.or(r)
        };
        if let Some(line) = pick {
            lines.push(*line);
        }
    }

    Merged {
        content: lines.join("\n"),
        collisions,
    }
}

/// Both versions bracketed by git-style markers.
pub fn manual(local: &str, remote: &str) -> String {
    let mut out = String::with_capacity(local.len() + remote.len() + 48);
    out.push_str(MARKER_LOCAL);
    out.push('\n');
    push_block(&mut out, local);
    out.push_str(MARKER_SPLIT);
    out.push('\n');
    push_block(&mut out, remote);
    out.push_str(MARKER_REMOTE);
    out.push('\n');
    out
}

fn push_block(out: &mut String, text: &str) {
    out.push_str(text);
    if !text.is_empty() && !text.ends_with('\n') {
        out.push('\n');
    }
}
