//! Parsing and resolving `[file:][func:]locator` linespecs into a target
//! `StopNode`.

use std::collections::HashMap;

use crate::ast::NodeRef;
use crate::walk::find;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// `±DIGITS`, relative to the cursor's line.
    Offset(i64),
    /// `DIGITS`, either absolute-in-file or relative to a `func:` prefix.
    Line(usize),
    /// `IDENT`, a function name.
    Ident(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpec {
    pub file: Option<String>,
    pub func: Option<String>,
    pub locator: Locator,
}

/// The cursor a relative linespec resolves against: the file and line the
/// debugger is currently stopped at.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub file: String,
    pub line: usize,
}

/// Registry of parsed modules, keyed by filename, the resolver consults for
/// both `file:` prefixes and bare-locator default-module lookups.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: HashMap<String, NodeRef>,
    default_file: Option<String>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filename: impl Into<String>, module: NodeRef) {
        let filename = filename.into();
        if self.default_file.is_none() {
            self.default_file = Some(filename.clone());
        }
        self.modules.insert(filename, module);
    }

    pub fn get(&self, filename: &str) -> Option<&NodeRef> {
        self.modules.get(filename)
    }

    pub fn default_module(&self) -> Option<&NodeRef> {
        self.default_file.as_ref().and_then(|f| self.modules.get(f))
    }

    fn find_function<'a>(&self, module: &'a NodeRef, name: &str) -> Option<NodeRef> {
        module
            .as_module()?
            .decls
            .iter()
            .find(|d| {
                d.as_function()
                    .and_then(|f| f.name.as_ref())
                    .and_then(|n| n.as_ident())
                    .map(|i| i.name == name)
                    .unwrap_or(false)
            })
            .cloned()
    }
}

/// Parse a linespec string into its three components. No regex: the grammar
/// is small enough to hand-scan left to right off `:`-delimited segments,
/// with the last segment always the locator.
pub fn parse_linespec(input: &str) -> Result<LineSpec, Error> {
    if input.is_empty() {
        return Err(Error::InvalidArgument("empty linespec".into()));
    }
    let segments: Vec<&str> = input.split(':').collect();
    let (file, func, locator_str) = match segments.len() {
        1 => (None, None, segments[0]),
        2 => (Some(segments[0]), None, segments[1]),
        3 => (Some(segments[0]), Some(segments[1]), segments[2]),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "malformed linespec: {}",
                input
            )))
        }
    };
    let locator = parse_locator(locator_str)?;
    Ok(LineSpec {
        file: file.map(|s| s.to_string()),
        func: func.map(|s| s.to_string()),
        locator,
    })
}

fn parse_locator(s: &str) -> Result<Locator, Error> {
    if s.is_empty() {
        return Err(Error::InvalidArgument("empty locator".into()));
    }
    let bytes = s.as_bytes();
    if bytes[0] == b'+' || bytes[0] == b'-' {
        let digits = &s[1..];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidArgument(format!("bad offset locator: {}", s)));
        }
        let magnitude: i64 = digits
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad offset locator: {}", s)))?;
        let signed = if bytes[0] == b'-' { -magnitude } else { magnitude };
        return Ok(Locator::Offset(signed));
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let line: usize = s
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad line locator: {}", s)))?;
        return Ok(Locator::Line(line));
    }
    Ok(Locator::Ident(s.to_string()))
}

/// Resolve a parsed linespec to a `StopNode`, relative to `cursor` (`None`
/// if the debugger is not currently stopped anywhere).
pub fn resolve(
    spec: &LineSpec,
    table: &ModuleTable,
    cursor: Option<&Cursor>,
) -> Result<NodeRef, Error> {
    let filename = spec
        .file
        .clone()
        .or_else(|| cursor.map(|c| c.file.clone()));

    let module = match (&spec.file, filename.as_deref()) {
        (Some(f), _) => table
            .get(f)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown file: {}", f)))?,
        (None, _) => table
            .default_module()
            .cloned()
            .ok_or_else(|| Error::NotFound("no module loaded".into()))?,
    };

    match (&spec.func, &spec.locator) {
        (_, Locator::Ident(name)) => {
            let func = table
                .find_function(&module, name)
                .ok_or_else(|| Error::NotFound(format!("undefined function: {}", name)))?;
            func.subject()
                .ok_or_else(|| Error::NotFound(format!("function has no subject: {}", name)))
        }
        (Some(func_name), Locator::Line(n)) => {
            let func = table
                .find_function(&module, func_name)
                .ok_or_else(|| Error::NotFound(format!("undefined function: {}", func_name)))?;
            let start_line = func.position().line;
            let target_line = start_line + n.saturating_sub(1);
            find_stop_at_line(&module, target_line)
        }
        (None, Locator::Line(n)) => find_stop_at_line(&module, *n),
        (_, Locator::Offset(delta)) => {
            let cursor = cursor.ok_or_else(|| {
                Error::InvalidArgument("offset locator requires an active cursor".into())
            })?;
            let target = cursor.line as i64 + delta;
            if target < 1 {
                return Err(Error::NotFound("offset resolves before file start".into()));
            }
            find_stop_at_line(&module, target as usize)
        }
    }
}

fn find_stop_at_line(module: &NodeRef, line: usize) -> Result<NodeRef, Error> {
    find(module, line, 0, |n: &NodeRef| n.is_stop_node())
        .ok_or_else(|| Error::NotFound(format!("no stop-node on line {}", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{block, call, function, ident, module, string_literal, Kind};
    use crate::position::Position;

    fn pos(line: usize, col: usize) -> Position {
        Position::new("build.hlb", 0, line, col)
    }

    fn sample_table() -> ModuleTable {
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
        let m = module("build.hlb", vec![func]);
        let mut table = ModuleTable::new();
        table.insert("build.hlb", m);
        table
    }

    #[test]
    fn s1_absolute_line_resolves_to_run() {
        let table = sample_table();
        let spec = parse_linespec("3").unwrap();
        let node = resolve(&spec, &table, None).unwrap();
        assert_eq!(node.as_call().unwrap().name(), "run");
    }

    #[test]
    fn s2_line_with_no_stop_node_is_not_found() {
        let table = sample_table();
        let spec = parse_linespec("4").unwrap();
        assert!(matches!(resolve(&spec, &table, None), Err(Error::NotFound(_))));
    }

    #[test]
    fn s3_positive_offset_from_cursor() {
        let table = sample_table();
        let spec = parse_linespec("+1").unwrap();
        let cursor = Cursor {
            file: "build.hlb".into(),
            line: 2,
        };
        let node = resolve(&spec, &table, Some(&cursor)).unwrap();
        assert_eq!(node.as_call().unwrap().name(), "run");
    }

    #[test]
    fn s4_negative_offset_from_cursor() {
        let table = sample_table();
        let spec = parse_linespec("-1").unwrap();
        let cursor = Cursor {
            file: "build.hlb".into(),
            line: 3,
        };
        let node = resolve(&spec, &table, Some(&cursor)).unwrap();
        assert_eq!(node.as_call().unwrap().name(), "image");
    }

    #[test]
    fn s5_ident_resolves_to_function_subject() {
        let table = sample_table();
        let spec = parse_linespec("default").unwrap();
        let node = resolve(&spec, &table, None).unwrap();
        assert_eq!(node.as_ident().unwrap().name, "default");
        assert_eq!(node.position().line, 1);
    }

    #[test]
    fn offset_without_cursor_is_invalid() {
        let table = sample_table();
        let spec = parse_linespec("+1").unwrap();
        assert!(matches!(
            resolve(&spec, &table, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_file_prefix_is_not_found() {
        let table = sample_table();
        let spec = parse_linespec("missing.hlb:3").unwrap();
        assert!(matches!(resolve(&spec, &table, None), Err(Error::NotFound(_))));
    }

    #[test]
    fn malformed_locator_is_invalid_argument() {
        assert!(parse_linespec("a:b:c:d").is_err());
    }
}
