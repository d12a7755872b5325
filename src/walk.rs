//! Depth-first tree walking, positional lookup, textual search, and the
//! right-to-left path matcher.

use crate::ast::{NodeKind, NodeRef};

/// The path from the tree root down to (and including) the node currently
/// being visited, handed to a `Walk` visitor so it can make decisions based
/// on ancestry.
#[derive(Debug, Clone)]
pub struct Path(Vec<NodeRef>);

impl Path {
    pub fn current(&self) -> &NodeRef {
        self.0.last().expect("path is never empty during a visit")
    }

    pub fn ancestors(&self) -> &[NodeRef] {
        &self.0[..self.0.len().saturating_sub(1)]
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn push(&self, node: NodeRef) -> Path {
        let mut v = self.0.clone();
        v.push(node);
        Path(v)
    }
}

/// Depth-first visit of `root` and its descendants. The visitor is called
/// once per node on entry (`Some(node)` by way of `path.current()`) and
/// once more after its children have all been visited, with `None`, as a
/// post-order marker — mirroring the pre/post-order contract of a visitor
/// that returns whether to descend.
///
/// `visit` returns `true` to descend into the current node's children,
/// `false` to prune.
pub fn walk<F>(root: &NodeRef, mut visit: F)
where
    F: FnMut(&Path, Option<&NodeRef>) -> bool,
{
    let path = Path(vec![root.clone()]);
    walk_inner(&path, &mut visit);
}

fn walk_inner<F>(path: &Path, visit: &mut F)
where
    F: FnMut(&Path, Option<&NodeRef>) -> bool,
{
    let node = path.current().clone();
    let descend = visit(path, Some(&node));
    if descend {
        for child in node.children() {
            let child_path = path.push(child);
            walk_inner(&child_path, visit);
        }
    }
    visit(path, None);
}

/// Whether a node spanning `[start, end)` contains `(line, column)`, per
/// spec.md §4.C: if any of the three columns involved is zero, fall back to
/// a line-range-only check; otherwise a strict half-open check on columns at
/// the boundary lines.
pub fn is_intersect(
    start_line: usize,
    start_col: usize,
    end_line: usize,
    end_col: usize,
    line: usize,
    column: usize,
) -> bool {
    if start_col == 0 || end_col == 0 || column == 0 {
        return start_line <= line && line <= end_line;
    }
    if line < start_line || line > end_line {
        return false;
    }
    if line == start_line && column < start_col {
        return false;
    }
    if line == end_line && column >= end_col {
        return false;
    }
    true
}

fn node_intersects(node: &NodeRef, line: usize, column: usize) -> bool {
    let start = node.position();
    // A synthetic position (e.g. `Module`, which has no span of its own)
    // names no real range to test against — always descend through it
    // rather than letting the zero-column fallback read it as empty.
    if start.is_synthetic() {
        return true;
    }
    let end = node.end();
    is_intersect(start.line, start.column, end.line, end.column, line, column)
}

/// Locate the deepest node containing `(line, column)` for which `filter`
/// returns true. When `column` is 0, a candidate must additionally start on
/// `line` to be reported, though descent still follows any child whose span
/// merely overlaps the line so that a deeper, column-bearing descendant can
/// still be found.
pub fn find<F>(root: &NodeRef, line: usize, column: usize, filter: F) -> Option<NodeRef>
where
    F: Fn(&NodeRef) -> bool,
{
    let mut best: Option<NodeRef> = None;
    walk(root, |path, node| {
        let node = match node {
            Some(n) => n,
            None => return false,
        };
        if !node_intersects(node, line, column) {
            return false;
        }
        let eligible = column != 0 || node.position().line == line;
        if eligible && filter(node) {
            best = Some(node.clone());
        }
        let _ = path;
        true
    });
    best
}

/// Search `root` for a node whose `Unparse()` contains `query`, skipping
/// `skip` exact hits before reporting one. Exact matches win outright;
/// absent an exact hit, the deepest node with a partial (substring) match is
/// returned.
///
/// Matching is scoped to statement-level stop nodes (`Call`/`Function`):
/// descending into a matched call's own subject ident would otherwise
/// re-match the same logical statement a second time (its ident's unparsed
/// text is always a substring, often an exact copy, of the call's name),
/// inflating the skip count and letting a leaf win over its enclosing
/// statement.
pub fn search(root: &NodeRef, query: &str, skip: usize) -> Option<NodeRef> {
    let mut remaining_skip = skip as isize;
    let mut exact: Option<NodeRef> = None;
    let mut partial: Option<NodeRef> = None;

    walk(root, |_path, node| {
        let node = match node {
            Some(n) => n,
            None => return false,
        };
        if exact.is_some() {
            return false;
        }
        if !node.is_stop_node() {
            return true;
        }
        let text = node.unparse();
        if text == query {
            if remaining_skip > 0 {
                remaining_skip -= 1;
            } else {
                exact = Some(node.clone());
                return false;
            }
        } else if text.contains(query) {
            partial = Some(node.clone());
        }
        true
    });

    exact.or(partial)
}

/// A single right-to-left path predicate: an ordered tuple of `NodeKind`s
/// that must appear, in order, walking the ancestor path from the current
/// node upward, with the tuple's last element required to equal the current
/// node's kind. Gaps between tuple elements are allowed (non-contiguous).
#[derive(Debug, Clone)]
pub struct PathMatcher {
    pub kinds: Vec<NodeKind>,
    pub allow_duplicates: bool,
}

impl PathMatcher {
    pub fn new(kinds: Vec<NodeKind>) -> Self {
        Self {
            kinds,
            allow_duplicates: false,
        }
    }

    pub fn allowing_duplicates(mut self) -> Self {
        self.allow_duplicates = true;
        self
    }

    /// Whether this matcher fires for the current path.
    pub fn matches(&self, path: &Path) -> bool {
        if self.kinds.is_empty() {
            return false;
        }
        let collapsed = collapse_duplicates(path, self.allow_duplicates);
        let mut tuple_idx = self.kinds.len();
        let mut path_idx = collapsed.len();
        if tuple_idx == 0 || path_idx == 0 {
            return false;
        }
        tuple_idx -= 1;
        path_idx -= 1;
        if collapsed[path_idx] != self.kinds[tuple_idx] {
            return false;
        }
        if tuple_idx == 0 {
            return true;
        }
        tuple_idx -= 1;
        loop {
            if path_idx == 0 {
                return false;
            }
            path_idx -= 1;
            if collapsed[path_idx] == self.kinds[tuple_idx] {
                if tuple_idx == 0 {
                    return true;
                }
                tuple_idx -= 1;
            }
        }
    }
}

fn collapse_duplicates(path: &Path, allow_duplicates: bool) -> Vec<NodeKind> {
    let kinds: Vec<NodeKind> = path.0.iter().map(|n| n.kind()).collect();
    if allow_duplicates {
        return kinds;
    }
    let mut out: Vec<NodeKind> = Vec::with_capacity(kinds.len());
    for k in kinds {
        if out.last() != Some(&k) {
            out.push(k);
        }
    }
    out
}

/// Run every matcher in `matchers` against every visited path in `root`,
/// invoking `on_match(index, path)` for each matcher (by its index into
/// `matchers`) that fires, in declaration order, at each visit.
pub fn match_path<F>(root: &NodeRef, matchers: &[PathMatcher], mut on_match: F)
where
    F: FnMut(usize, &Path),
{
    walk(root, |path, node| {
        if node.is_none() {
            return false;
        }
        for (i, m) in matchers.iter().enumerate() {
            if m.matches(path) {
                on_match(i, path);
            }
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{block, call, function, ident, int_literal, module, string_literal, Kind};
    use crate::position::Position;

    fn pos(line: usize, col: usize) -> Position {
        Position::new("build.hlb", 0, line, col)
    }

    fn sample() -> NodeRef {
        let image = call(
            pos(2, 5),
            pos(2, 21),
            None,
            ident(pos(2, 5), pos(2, 10), "image"),
            vec![string_literal(pos(2, 11), pos(2, 20), "alpine")],
            None,
            None,
            false,
        );
        let run = call(
            pos(3, 5),
            pos(3, 27),
            None,
            ident(pos(3, 5), pos(3, 8), "run"),
            vec![string_literal(pos(3, 9), pos(3, 26), "echo hello")],
            None,
            None,
            false,
        );
        let body = block(pos(1, 16), pos(4, 2), vec![image, run]);
        let name = ident(pos(1, 4), pos(1, 11), "default");
        let func = function(
            pos(1, 1),
            pos(4, 2),
            Some(name),
            Vec::new(),
            Kind::Fs,
            Vec::new(),
            body,
        );
        module("build.hlb", vec![func])
    }

    #[test]
    fn walk_visits_pre_and_post_order() {
        let m = sample();
        let mut enters = 0;
        let mut exits = 0;
        walk(&m, |_p, n| {
            if n.is_some() {
                enters += 1;
            } else {
                exits += 1;
            }
            true
        });
        assert_eq!(enters, exits);
        assert!(enters > 5);
    }

    #[test]
    fn find_deepest_line_match() {
        let m = sample();
        let found = find(&m, 3, 0, |_| true).unwrap();
        assert_eq!(found.kind(), NodeKind::Call);
        assert_eq!(found.as_call().unwrap().name(), "run");
    }

    #[test]
    fn find_line_with_no_stop_node_is_none() {
        let m = sample();
        let found = find(&m, 4, 0, |n| n.is_stop_node());
        assert!(found.is_none());
    }

    #[test]
    fn find_honors_filter_while_descending_past_rejects() {
        let m = sample();
        // line 3 col 6 sits inside the `run` call; filtering to only Idents
        // should still land on the ident rather than stopping at the call.
        let found = find(&m, 3, 6, |n| n.kind() == NodeKind::Ident).unwrap();
        assert_eq!(found.kind(), NodeKind::Ident);
    }

    #[test]
    fn search_finds_second_occurrence_with_skip() {
        let m = sample();
        let image = call(
            pos(5, 5),
            pos(5, 20),
            None,
            ident(pos(5, 5), pos(5, 8), "run"),
            vec![string_literal(pos(5, 9), pos(5, 19), "again")],
            None,
            None,
            false,
        );
        // build a second module with two `run` calls to match S7.
        let run1 = call(
            pos(2, 5),
            pos(2, 20),
            None,
            ident(pos(2, 5), pos(2, 8), "run"),
            vec![string_literal(pos(2, 9), pos(2, 19), "first")],
            None,
            None,
            false,
        );
        let body = block(pos(1, 16), pos(6, 2), vec![run1, image]);
        let func = function(
            pos(1, 1),
            pos(6, 2),
            Some(ident(pos(1, 4), pos(1, 11), "default")),
            Vec::new(),
            Kind::Fs,
            Vec::new(),
            body,
        );
        let m2 = module("build.hlb", vec![func]);
        let found = search(&m2, "run", 1).unwrap();
        assert_eq!(found.as_call().unwrap().name(), "run");
        assert_eq!(found.position().line, 5);
        let _ = m;
    }

    #[test]
    fn path_matcher_matches_right_to_left_non_contiguous() {
        let m = sample();
        let matcher = PathMatcher::new(vec![NodeKind::Function, NodeKind::Call]);
        let mut hits = 0;
        match_path(&m, &[matcher], |_i, _p| hits += 1);
        assert_eq!(hits, 2);
    }

    #[test]
    fn find_with_stop_node_filter_returns_call_spanning_its_with_block() {
        // `run "echo hello" with option { ... }` starting on line 5, whose
        // `with` block closes on line 7 — S8: Find at the call's own line
        // must return the whole call, not descend into the with block.
        let opt = call(
            pos(6, 9),
            pos(6, 24),
            None,
            ident(pos(6, 9), pos(6, 16), "network"),
            vec![string_literal(pos(6, 17), pos(6, 23), "host")],
            None,
            None,
            true,
        );
        let with_block = block(pos(5, 30), pos(7, 6), vec![opt]);
        let run = call(
            pos(5, 5),
            pos(7, 6),
            None,
            ident(pos(5, 5), pos(5, 8), "run"),
            vec![string_literal(pos(5, 9), pos(5, 21), "echo hello")],
            Some(with_block),
            None,
            false,
        );
        let body = block(pos(1, 16), pos(8, 2), vec![run]);
        let func = function(
            pos(1, 1),
            pos(8, 2),
            Some(ident(pos(1, 4), pos(1, 11), "default")),
            Vec::new(),
            Kind::Fs,
            Vec::new(),
            body,
        );
        let m = module("build.hlb", vec![func]);

        let found = find(&m, 5, 0, |n| n.is_stop_node()).unwrap();
        assert_eq!(found.kind(), NodeKind::Call);
        assert_eq!(found.as_call().unwrap().name(), "run");
        assert_eq!(found.end(), pos(7, 6));
    }

    #[test]
    fn int_literal_never_matches_call_matcher() {
        let lit = int_literal(pos(1, 1), pos(1, 2), 1);
        let matcher = PathMatcher::new(vec![NodeKind::Call]);
        let mut hits = 0;
        match_path(&lit, &[matcher], |_i, _p| hits += 1);
        assert_eq!(hits, 0);
    }
}
