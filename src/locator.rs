//! Structural detection of the three cooperating helpers: the string-table
//! function, the shuffle IIFE and the decode function(s).
//!
//! Every pattern is a list of predicates over a [`Candidate`] stored in a
//! [`PatternTable`]. Nothing here executes code.

use swc_core::ecma::{
    ast::*,
    visit::{Visit, VisitWith},
};
use tracing::debug;

use crate::config::{LoopTest, PatternConfig};
use crate::error::LocateError;

// -----------------------------------------------------------------------------
// Pattern table
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternName {
    StringTable,
    ShuffleUnit,
    DecodeFunction,
}

impl PatternName {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternName::StringTable => "string-table",
            PatternName::ShuffleUnit => "shuffle-unit",
            PatternName::DecodeFunction => "decode-function",
        }
    }
}

/// A node a predicate is asked about.
#[derive(Clone, Copy)]
pub enum Candidate<'a> {
    Function(&'a FnDecl),
    Call(&'a CallExpr),
}

pub struct MatchEnv<'a> {
    pub config: &'a PatternConfig,
    /// Binding of the string-table function, once it is known.
    pub string_table: Option<&'a Id>,
}

pub type Predicate = fn(Candidate<'_>, &MatchEnv<'_>) -> bool;

pub struct PatternTable {
    entries: Vec<(PatternName, Vec<Predicate>)>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self {
            entries: vec![
                (
                    PatternName::StringTable,
                    vec![is_function as Predicate, first_stmt_is_var_decl, inits_string_array],
                ),
                (
                    PatternName::ShuffleUnit,
                    vec![is_iife as Predicate, has_shuffle_loop, shuffle_loop_rotates],
                ),
                (
                    PatternName::DecodeFunction,
                    vec![is_function as Predicate, first_stmt_is_var_decl, inits_from_string_table],
                ),
            ],
        }
    }
}

impl PatternTable {
    /// Adds a predicate that must also hold for `name` to match.
    pub fn with_predicate(mut self, name: PatternName, predicate: Predicate) -> Self {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, predicates)) => predicates.push(predicate),
            None => self.entries.push((name, vec![predicate])),
        }
        self
    }

    pub fn matches(&self, name: PatternName, candidate: Candidate<'_>, env: &MatchEnv<'_>) -> bool {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, predicates)| {
                !predicates.is_empty() && predicates.iter().all(|p| p(candidate, env))
            })
            .unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Predicates
// -----------------------------------------------------------------------------

fn is_function(candidate: Candidate<'_>, _env: &MatchEnv<'_>) -> bool {
    matches!(candidate, Candidate::Function(f) if f.function.body.is_some())
}

fn first_stmt_is_var_decl(candidate: Candidate<'_>, _env: &MatchEnv<'_>) -> bool {
    first_declarator(candidate).is_some()
}

/// `var t = ['a', 'b', ...];` with at least one element and only string literals.
fn inits_string_array(candidate: Candidate<'_>, _env: &MatchEnv<'_>) -> bool {
    let Some(Expr::Array(array)) = first_declarator(candidate)
        .and_then(|d| d.init.as_deref())
        .map(unparen)
    else {
        return false;
    };
    !array.elems.is_empty()
        && array.elems.iter().all(|el| match el {
            Some(ExprOrSpread { spread: None, expr }) => matches!(&**expr, Expr::Lit(Lit::Str(_))),
            _ => false,
        })
}

/// `var t = stringTable();`
fn inits_from_string_table(candidate: Candidate<'_>, env: &MatchEnv<'_>) -> bool {
    let Some(table) = env.string_table else {
        return false;
    };
    let Some(Expr::Call(call)) = first_declarator(candidate)
        .and_then(|d| d.init.as_deref())
        .map(unparen)
    else {
        return false;
    };
    match &call.callee {
        Callee::Expr(callee) => matches!(unparen(callee), Expr::Ident(i) if i.to_id() == *table),
        _ => false,
    }
}

fn is_iife(candidate: Candidate<'_>, _env: &MatchEnv<'_>) -> bool {
    iife_body(candidate).is_some()
}

fn has_shuffle_loop(candidate: Candidate<'_>, env: &MatchEnv<'_>) -> bool {
    shuffle_loops(candidate, env.config).next().is_some()
}

fn shuffle_loop_rotates(candidate: Candidate<'_>, env: &MatchEnv<'_>) -> bool {
    shuffle_loops(candidate, env.config).any(|w| loop_body_rotates(&w.body, env.config))
}

// ---------- predicate helpers ----------

fn unparen(expr: &Expr) -> &Expr {
    let mut e = expr;
    while let Expr::Paren(p) = e {
        e = &p.expr;
    }
    e
}

fn first_declarator<'a>(candidate: Candidate<'a>) -> Option<&'a VarDeclarator> {
    let Candidate::Function(f) = candidate else {
        return None;
    };
    match f.function.body.as_ref()?.stmts.first()? {
        Stmt::Decl(Decl::Var(var)) => var.decls.first(),
        _ => None,
    }
}

fn iife_body<'a>(candidate: Candidate<'a>) -> Option<&'a [Stmt]> {
    let Candidate::Call(call) = candidate else {
        return None;
    };
    let Callee::Expr(callee) = &call.callee else {
        return None;
    };
    match unparen(callee) {
        Expr::Fn(f) => f.function.body.as_ref().map(|b| b.stmts.as_slice()),
        Expr::Arrow(arrow) => match &*arrow.body {
            BlockStmtOrExpr::BlockStmt(b) => Some(b.stmts.as_slice()),
            BlockStmtOrExpr::Expr(_) => None,
        },
        _ => None,
    }
}

/// Top-level `while` statements of the IIFE body with an accepted condition.
fn shuffle_loops<'a>(
    candidate: Candidate<'a>,
    config: &'a PatternConfig,
) -> impl Iterator<Item = &'a WhileStmt> + 'a {
    iife_body(candidate)
        .unwrap_or_default()
        .iter()
        .filter_map(|stmt| match stmt {
            Stmt::While(w) => Some(w),
            _ => None,
        })
        .filter(move |w| config.loop_tests.iter().any(|t| loop_test_matches(*t, &w.test)))
}

fn loop_test_matches(test: LoopTest, expr: &Expr) -> bool {
    let expr = unparen(expr);
    match test {
        LoopTest::DoubleNegatedArray => match expr {
            Expr::Unary(UnaryExpr { op: UnaryOp::Bang, arg, .. }) => matches!(
                unparen(arg),
                Expr::Unary(UnaryExpr { op: UnaryOp::Bang, arg, .. })
                    if matches!(unparen(arg), Expr::Array(a) if a.elems.is_empty())
            ),
            _ => false,
        },
        LoopTest::TrueLiteral => matches!(expr, Expr::Lit(Lit::Bool(Bool { value: true, .. }))),
        LoopTest::NegatedZero => matches!(
            expr,
            Expr::Unary(UnaryExpr { op: UnaryOp::Bang, arg, .. })
                if matches!(unparen(arg), Expr::Lit(Lit::Num(n)) if n.value == 0.0)
        ),
    }
}

/// The loop body holds a `try` whose `catch` rotates the table.
fn loop_body_rotates(body: &Stmt, config: &PatternConfig) -> bool {
    let stmts: &[Stmt] = match body {
        Stmt::Block(b) => &b.stmts,
        other => std::slice::from_ref(other),
    };
    stmts.iter().any(|stmt| match stmt {
        Stmt::Try(t) => {
            if !config.require_catch_rotation {
                return true;
            }
            t.handler
                .as_ref()
                .map(|h| h.body.stmts.iter().any(|s| is_rotation_stmt(s, config)))
                .unwrap_or(false)
        }
        _ => false,
    })
}

/// `t.push(t.shift())` or `t['push'](t['shift']())` on the same receiver.
fn is_rotation_stmt(stmt: &Stmt, config: &PatternConfig) -> bool {
    let Stmt::Expr(ExprStmt { expr, .. }) = stmt else {
        return false;
    };
    let Expr::Call(outer) = unparen(expr) else {
        return false;
    };
    let Some(push_recv) = method_receiver(outer, &config.rotate_push) else {
        return false;
    };
    let [arg] = outer.args.as_slice() else {
        return false;
    };
    let Expr::Call(inner) = unparen(&arg.expr) else {
        return false;
    };
    method_receiver(inner, &config.rotate_shift) == Some(push_recv)
}

fn method_receiver<'a>(call: &'a CallExpr, method: &str) -> Option<&'a str> {
    let Callee::Expr(callee) = &call.callee else {
        return None;
    };
    let Expr::Member(member) = unparen(callee) else {
        return None;
    };
    let name_matches = match &member.prop {
        MemberProp::Ident(i) => i.sym.as_ref() == method,
        MemberProp::Computed(c) => {
            matches!(unparen(&c.expr), Expr::Lit(Lit::Str(s)) if s.value.as_ref() == method)
        }
        MemberProp::PrivateName(_) => false,
    };
    match unparen(&member.obj) {
        Expr::Ident(i) if name_matches => Some(i.sym.as_ref()),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Locator
// -----------------------------------------------------------------------------

/// The located helper triple. Holds clones of the matched nodes; the
/// Extractor assembles them into a new program unit.
#[derive(Debug, Clone)]
pub struct LocatorResult {
    pub string_table: FnDecl,
    pub shuffle_unit: CallExpr,
    /// In source order.
    pub decoders: Vec<FnDecl>,
}

pub struct Locator<'a> {
    table: &'a PatternTable,
    config: &'a PatternConfig,
}

impl<'a> Locator<'a> {
    pub fn new(table: &'a PatternTable, config: &'a PatternConfig) -> Self {
        Self { table, config }
    }

    pub fn locate(&self, program: &Program) -> Result<LocatorResult, LocateError> {
        let mut helpers = HelperCollector {
            table: self.table,
            env: MatchEnv {
                config: self.config,
                string_table: None,
            },
            string_tables: vec![],
            shuffle_units: vec![],
        };
        program.visit_with(&mut helpers);

        let string_table = unique(PatternName::StringTable, helpers.string_tables)?;
        let shuffle_unit = unique(PatternName::ShuffleUnit, helpers.shuffle_units)?;

        let table_id = string_table.ident.to_id();
        let mut decoders = DecoderCollector {
            table: self.table,
            env: MatchEnv {
                config: self.config,
                string_table: Some(&table_id),
            },
            out: vec![],
        };
        program.visit_with(&mut decoders);

        debug!(
            string_table = %string_table.ident.sym,
            decoders = decoders.out.len(),
            "located helper functions"
        );
        Ok(LocatorResult {
            string_table,
            shuffle_unit,
            decoders: decoders.out,
        })
    }
}

fn unique<T>(pattern: PatternName, mut found: Vec<T>) -> Result<T, LocateError> {
    match found.len() {
        0 => Err(LocateError::PatternNotFound {
            pattern: pattern.as_str(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(LocateError::AmbiguousPattern {
            pattern: pattern.as_str(),
            count,
        }),
    }
}

struct HelperCollector<'a> {
    table: &'a PatternTable,
    env: MatchEnv<'a>,
    string_tables: Vec<FnDecl>,
    shuffle_units: Vec<CallExpr>,
}

impl Visit for HelperCollector<'_> {
    fn visit_fn_decl(&mut self, n: &FnDecl) {
        if self
            .table
            .matches(PatternName::StringTable, Candidate::Function(n), &self.env)
        {
            self.string_tables.push(n.clone());
        }
        n.visit_children_with(self);
    }

    fn visit_call_expr(&mut self, n: &CallExpr) {
        if self
            .table
            .matches(PatternName::ShuffleUnit, Candidate::Call(n), &self.env)
        {
            self.shuffle_units.push(n.clone());
        }
        n.visit_children_with(self);
    }
}

struct DecoderCollector<'a> {
    table: &'a PatternTable,
    env: MatchEnv<'a>,
    out: Vec<FnDecl>,
}

impl Visit for DecoderCollector<'_> {
    fn visit_fn_decl(&mut self, n: &FnDecl) {
        if self
            .table
            .matches(PatternName::DecodeFunction, Candidate::Function(n), &self.env)
        {
            self.out.push(n.clone());
        }
        n.visit_children_with(self);
    }
}
