//! The typed concrete syntax tree: declarations, statements, expressions,
//! and the narrow capability traits (`StopNode`, `CallNode`) the debugger
//! and linespec resolver need over them.
//!
//! Nodes are tagged variants (`Node`), not an inheritance hierarchy, held
//! behind `Rc` so that breakpoints and stack frames can reference a node
//! without owning it — the module that parsed the tree remains its only
//! owner, consistent with the component ownership order (buffers outlive
//! the AST, the AST outlives debugger state).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::position::Position;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn fresh() -> Self {
        NodeId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A function's declared return shape. `Option` carries the nested
/// `option::sub` variant as its named sub-kind, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    None,
    String,
    Int,
    Bool,
    Fs,
    Pipeline,
    Option(Option<String>),
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::None => write!(f, "none"),
            Kind::String => write!(f, "string"),
            Kind::Int => write!(f, "int"),
            Kind::Bool => write!(f, "bool"),
            Kind::Fs => write!(f, "fs"),
            Kind::Pipeline => write!(f, "pipeline"),
            Kind::Option(Some(sub)) => write!(f, "option::{}", sub),
            Kind::Option(None) => write!(f, "option"),
        }
    }
}

/// Discriminant naming a node's concrete shape, independent of its payload —
/// used by the `Match` path matcher and by logging, which names a node
/// without formatting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Module,
    Import,
    Export,
    Function,
    DeclComment,
    DeclBlank,
    Block,
    Call,
    ExprStmt,
    StmtComment,
    StmtBlank,
    FuncLiteral,
    Literal,
    Ident,
}

#[derive(Debug, Clone)]
pub enum LiteralValue {
    Int(i64),
    Bool(bool),
    /// An interpolated string or heredoc, kept as an ordered sequence of
    /// literal text and interpolated sub-expressions so `Unparse` can
    /// reproduce the original shape.
    String(Vec<StringPart>),
}

#[derive(Debug, Clone)]
pub enum StringPart {
    Text(String),
    Interp(NodeRef),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: Kind,
}

#[derive(Debug)]
pub struct Ident {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub name: String,
}

#[derive(Debug)]
pub struct Module {
    pub id: NodeId,
    pub filename: String,
    pub decls: Vec<NodeRef>,
}

#[derive(Debug)]
pub struct ImportDecl {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub path: String,
}

#[derive(Debug)]
pub struct ExportDecl {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub name: String,
}

/// A function declaration, also reused (with `name: None`) as the shape of
/// a function literal appearing in expression position.
#[derive(Debug)]
pub struct FunctionDecl {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub name: Option<NodeRef>,
    pub params: Vec<Param>,
    pub returns: Kind,
    /// Named effect outputs declared by a `binds (...)` clause.
    pub effects: Vec<Param>,
    pub body: NodeRef,
}

#[derive(Debug)]
pub struct CommentNode {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub text: String,
}

#[derive(Debug)]
pub struct BlankNode {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub lines: usize,
}

#[derive(Debug)]
pub struct Block {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub stmts: Vec<NodeRef>,
}

/// A call to `[module.]ident(args) [with expr] [as (names)] [;]`.
///
/// The same shape serves both call statements and call expressions;
/// `with_clause`/`as_bind`/`has_terminator` are only ever populated when the
/// call appears as a statement.
#[derive(Debug)]
pub struct Call {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub module: Option<String>,
    pub ident: NodeRef,
    pub args: Vec<NodeRef>,
    pub with_clause: Option<NodeRef>,
    pub as_bind: Option<Vec<String>>,
    pub has_terminator: bool,
    signature: RefCell<Option<Vec<Kind>>>,
}

impl Call {
    pub fn signature(&self) -> Option<Vec<Kind>> {
        self.signature.borrow().clone()
    }

    /// Filled in by the (out-of-scope) checker once it has resolved the
    /// callee; absent for calls to functions the checker never resolved.
    pub fn set_signature(&self, sig: Vec<Kind>) {
        *self.signature.borrow_mut() = Some(sig);
    }

    pub fn name(&self) -> &str {
        match &*self.ident {
            Node::Ident(i) => &i.name,
            _ => unreachable!("Call::ident is always Node::Ident"),
        }
    }
}

#[derive(Debug)]
pub struct ExprStmt {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub expr: NodeRef,
}

#[derive(Debug)]
pub struct Literal {
    pub id: NodeId,
    pub start: Position,
    pub end: Position,
    pub value: LiteralValue,
}

/// One node in the tree. Variants are tagged data, not subclasses; capability
/// access (`StopNode`, `CallNode`) goes through the narrow accessor methods
/// below rather than a shared supertype.
#[derive(Debug)]
pub enum Node {
    Module(Module),
    Import(ImportDecl),
    Export(ExportDecl),
    Function(FunctionDecl),
    DeclComment(CommentNode),
    DeclBlank(BlankNode),
    Block(Block),
    Call(Call),
    ExprStmt(ExprStmt),
    StmtComment(CommentNode),
    StmtBlank(BlankNode),
    FuncLiteral(FunctionDecl),
    Literal(Literal),
    Ident(Ident),
}

pub type NodeRef = Rc<Node>;

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Module(n) => n.id,
            Node::Import(n) => n.id,
            Node::Export(n) => n.id,
            Node::Function(n) => n.id,
            Node::DeclComment(n) => n.id,
            Node::DeclBlank(n) => n.id,
            Node::Block(n) => n.id,
            Node::Call(n) => n.id,
            Node::ExprStmt(n) => n.id,
            Node::StmtComment(n) => n.id,
            Node::StmtBlank(n) => n.id,
            Node::FuncLiteral(n) => n.id,
            Node::Literal(n) => n.id,
            Node::Ident(n) => n.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Module(_) => NodeKind::Module,
            Node::Import(_) => NodeKind::Import,
            Node::Export(_) => NodeKind::Export,
            Node::Function(_) => NodeKind::Function,
            Node::DeclComment(_) => NodeKind::DeclComment,
            Node::DeclBlank(_) => NodeKind::DeclBlank,
            Node::Block(_) => NodeKind::Block,
            Node::Call(_) => NodeKind::Call,
            Node::ExprStmt(_) => NodeKind::ExprStmt,
            Node::StmtComment(_) => NodeKind::StmtComment,
            Node::StmtBlank(_) => NodeKind::StmtBlank,
            Node::FuncLiteral(_) => NodeKind::FuncLiteral,
            Node::Literal(_) => NodeKind::Literal,
            Node::Ident(_) => NodeKind::Ident,
        }
    }

    /// First byte of the node. Zero-valued for synthetic nodes.
    pub fn position(&self) -> Position {
        match self {
            Node::Module(_) => Position::synthetic(),
            Node::Import(n) => n.start.clone(),
            Node::Export(n) => n.start.clone(),
            Node::Function(n) => n.start.clone(),
            Node::DeclComment(n) => n.start.clone(),
            Node::DeclBlank(n) => n.start.clone(),
            Node::Block(n) => n.start.clone(),
            Node::Call(n) => n.start.clone(),
            Node::ExprStmt(n) => n.start.clone(),
            Node::StmtComment(n) => n.start.clone(),
            Node::StmtBlank(n) => n.start.clone(),
            Node::FuncLiteral(n) => n.start.clone(),
            Node::Literal(n) => n.start.clone(),
            Node::Ident(n) => n.start.clone(),
        }
    }

    /// One-past-last byte of the node.
    pub fn end(&self) -> Position {
        match self {
            Node::Module(_) => Position::synthetic(),
            Node::Import(n) => n.end.clone(),
            Node::Export(n) => n.end.clone(),
            Node::Function(n) => n.end.clone(),
            Node::DeclComment(n) => n.end.clone(),
            Node::DeclBlank(n) => n.end.clone(),
            Node::Block(n) => n.end.clone(),
            Node::Call(n) => n.end.clone(),
            Node::ExprStmt(n) => n.end.clone(),
            Node::StmtComment(n) => n.end.clone(),
            Node::StmtBlank(n) => n.end.clone(),
            Node::FuncLiteral(n) => n.end.clone(),
            Node::Literal(n) => n.end.clone(),
            Node::Ident(n) => n.end.clone(),
        }
    }

    /// Direct children, in source order, for `Walk`.
    pub fn children(&self) -> Vec<NodeRef> {
        match self {
            Node::Module(n) => n.decls.clone(),
            Node::Function(n) => {
                let mut c: Vec<NodeRef> = n.name.iter().cloned().collect();
                c.push(n.body.clone());
                c
            }
            Node::FuncLiteral(n) => {
                let mut c: Vec<NodeRef> = n.name.iter().cloned().collect();
                c.push(n.body.clone());
                c
            }
            Node::Block(n) => n.stmts.clone(),
            Node::Call(n) => {
                let mut c = vec![n.ident.clone()];
                c.extend(n.args.iter().cloned());
                c.extend(n.with_clause.iter().cloned());
                c
            }
            Node::ExprStmt(n) => vec![n.expr.clone()],
            Node::Literal(n) => match &n.value {
                LiteralValue::String(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        StringPart::Interp(e) => Some(e.clone()),
                        StringPart::Text(_) => None,
                    })
                    .collect(),
                _ => Vec::new(),
            },
            Node::Import(_)
            | Node::Export(_)
            | Node::DeclComment(_)
            | Node::DeclBlank(_)
            | Node::StmtComment(_)
            | Node::StmtBlank(_)
            | Node::Ident(_) => Vec::new(),
        }
    }

    /// Whether the stepper may suspend here.
    pub fn is_stop_node(&self) -> bool {
        matches!(self, Node::Call(_) | Node::Function(_))
    }

    /// The display node used as the canonical stop target: the call's or
    /// function's name. `None` for nodes that are not `StopNode`s.
    pub fn subject(&self) -> Option<NodeRef> {
        match self {
            Node::Call(c) => Some(c.ident.clone()),
            Node::Function(f) => f.name.clone(),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Node::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionDecl> {
        match self {
            Node::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Node::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match self {
            Node::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_ident(&self) -> Option<&Ident> {
        match self {
            Node::Ident(i) => Some(i),
            _ => None,
        }
    }

    /// Render the node back to source text. Idempotent on already-canonical
    /// input: `parse(unparse(n)).unparse() == n.unparse()`.
    pub fn unparse(&self) -> String {
        match self {
            Node::Module(n) => n
                .decls
                .iter()
                .map(|d| d.unparse())
                .collect::<Vec<_>>()
                .join("\n"),
            Node::Import(n) => format!("import \"{}\"", n.path),
            Node::Export(n) => format!("export {}", n.name),
            Node::Function(n) | Node::FuncLiteral(n) => unparse_function(n),
            Node::DeclComment(n) | Node::StmtComment(n) => format!("#{}", n.text),
            Node::DeclBlank(n) | Node::StmtBlank(n) => "\n".repeat(n.lines),
            Node::Block(n) => {
                let body = n
                    .stmts
                    .iter()
                    .map(|s| s.unparse())
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{{\n{}\n}}", body)
            }
            Node::Call(n) => unparse_call(n),
            Node::ExprStmt(n) => n.expr.unparse(),
            Node::Literal(n) => unparse_literal(n),
            Node::Ident(n) => n.name.clone(),
        }
    }
}

fn unparse_function(f: &FunctionDecl) -> String {
    let params = f
        .params
        .iter()
        .map(|p| format!("{}: {}", p.name, p.kind))
        .collect::<Vec<_>>()
        .join(", ");
    let name = f.name.as_ref().map(|n| n.unparse()).unwrap_or_default();
    let effects = if f.effects.is_empty() {
        String::new()
    } else {
        let names = f
            .effects
            .iter()
            .map(|p| p.name.clone())
            .collect::<Vec<_>>()
            .join(", ");
        format!(" binds ({})", names)
    };
    format!(
        "{} {}({}){} {}",
        f.returns,
        name,
        params,
        effects,
        f.body.unparse()
    )
}

fn unparse_call(c: &Call) -> String {
    let callee = match &c.module {
        Some(m) => format!("{}.{}", m, c.name()),
        None => c.name().to_string(),
    };
    let args = c
        .args
        .iter()
        .map(|a| a.unparse())
        .collect::<Vec<_>>()
        .join(", ");
    let mut s = format!("{}({})", callee, args);
    if let Some(w) = &c.with_clause {
        s.push_str(&format!(" with {}", w.unparse()));
    }
    if let Some(binds) = &c.as_bind {
        s.push_str(&format!(" as ({})", binds.join(", ")));
    }
    if c.has_terminator {
        s.push(';');
    }
    s
}

fn unparse_literal(l: &Literal) -> String {
    match &l.value {
        LiteralValue::Int(i) => i.to_string(),
        LiteralValue::Bool(b) => b.to_string(),
        LiteralValue::String(parts) => {
            let mut s = String::from("\"");
            for part in parts {
                match part {
                    StringPart::Text(t) => s.push_str(t),
                    StringPart::Interp(e) => s.push_str(&format!("${{{}}}", e.unparse())),
                }
            }
            s.push('"');
            s
        }
    }
}

/// Construct helpers used by the linespec resolver, debugger, and tests to
/// build nodes without hand-assigning ids.
pub fn ident(start: Position, end: Position, name: impl Into<String>) -> NodeRef {
    Rc::new(Node::Ident(Ident {
        id: NodeId::fresh(),
        start,
        end,
        name: name.into(),
    }))
}

pub fn call(
    start: Position,
    end: Position,
    module: Option<String>,
    ident: NodeRef,
    args: Vec<NodeRef>,
    with_clause: Option<NodeRef>,
    as_bind: Option<Vec<String>>,
    has_terminator: bool,
) -> NodeRef {
    Rc::new(Node::Call(Call {
        id: NodeId::fresh(),
        start,
        end,
        module,
        ident,
        args,
        with_clause,
        as_bind,
        has_terminator,
        signature: RefCell::new(None),
    }))
}

pub fn block(start: Position, end: Position, stmts: Vec<NodeRef>) -> NodeRef {
    Rc::new(Node::Block(Block {
        id: NodeId::fresh(),
        start,
        end,
        stmts,
    }))
}

pub fn function(
    start: Position,
    end: Position,
    name: Option<NodeRef>,
    params: Vec<Param>,
    returns: Kind,
    effects: Vec<Param>,
    body: NodeRef,
) -> NodeRef {
    Rc::new(Node::Function(FunctionDecl {
        id: NodeId::fresh(),
        start,
        end,
        name,
        params,
        returns,
        effects,
        body,
    }))
}

pub fn module(filename: impl Into<String>, decls: Vec<NodeRef>) -> Rc<Node> {
    Rc::new(Node::Module(Module {
        id: NodeId::fresh(),
        filename: filename.into(),
        decls,
    }))
}

pub fn int_literal(start: Position, end: Position, v: i64) -> NodeRef {
    Rc::new(Node::Literal(Literal {
        id: NodeId::fresh(),
        start,
        end,
        value: LiteralValue::Int(v),
    }))
}

pub fn string_literal(start: Position, end: Position, text: impl Into<String>) -> NodeRef {
    Rc::new(Node::Literal(Literal {
        id: NodeId::fresh(),
        start,
        end,
        value: LiteralValue::String(vec![StringPart::Text(text.into())]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: usize, col: usize) -> Position {
        Position::new("build.hlb", 0, line, col)
    }

    fn sample_module() -> NodeRef {
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
    fn call_is_stop_node_with_ident_subject() {
        let m = sample_module();
        let func = &m.as_module().unwrap().decls[0];
        let body = func.as_function().unwrap().body.clone();
        let run = &body.as_block().unwrap().stmts[1];
        assert!(run.is_stop_node());
        let subject = run.subject().unwrap();
        assert_eq!(subject.as_ident().unwrap().name, "run");
    }

    #[test]
    fn function_subject_is_name_node() {
        let m = sample_module();
        let func = &m.as_module().unwrap().decls[0];
        let subject = func.subject().unwrap();
        assert_eq!(subject.position().line, 1);
        assert_eq!(subject.as_ident().unwrap().name, "default");
    }

    #[test]
    fn unparse_round_trips_shape() {
        let m = sample_module();
        let text = m.unparse();
        assert!(text.contains("run(\"echo hello\")"));
        assert!(text.contains("image(\"alpine\")"));
    }

    #[test]
    fn literal_is_not_a_stop_node() {
        let lit = int_literal(pos(1, 1), pos(1, 2), 4);
        assert!(!lit.is_stop_node());
    }

    #[test]
    fn node_ids_are_distinct() {
        let a = ident(pos(1, 1), pos(1, 2), "a");
        let b = ident(pos(1, 1), pos(1, 2), "a");
        assert_ne!(a.id(), b.id());
    }
}
