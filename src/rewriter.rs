//! Replaces decode calls in the original tree with the strings they return.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use swc_core::{
    common::Span,
    ecma::{
        ast::*,
        visit::{Visit, VisitMut, VisitMutWith, VisitWith},
    },
};
use tracing::debug;

use crate::error::SandboxError;
use crate::sandbox::Decode;

// -----------------------------------------------------------------------------
// Binding resolution
// -----------------------------------------------------------------------------

/// Maps callee bindings to decoder slots.
///
/// Resolution is lexical: an identifier resolves to a decoder only if its
/// binding is the decoder's own declaration, or a local alias chain ending
/// there. Shadowing parameters and locals have different bindings and never
/// resolve.
#[derive(Debug, Default)]
pub struct DecoderBindings {
    decoders: HashMap<Id, usize>,
    /// `None` marks a binding that is also assigned something else.
    aliases: HashMap<Id, Option<Id>>,
    max_depth: usize,
}

impl DecoderBindings {
    pub fn collect(program: &Program, decoder_ids: &[Id], max_depth: usize) -> Self {
        let decoders: HashMap<Id, usize> = decoder_ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (id.clone(), slot))
            .collect();
        let mut collector = AliasCollector {
            decoders: &decoders,
            aliases: HashMap::new(),
        };
        program.visit_with(&mut collector);
        let aliases = collector.aliases;
        Self {
            decoders,
            aliases,
            max_depth,
        }
    }

    pub fn resolve(&self, callee: &Ident) -> Option<usize> {
        let mut id = callee.to_id();
        for _ in 0..=self.max_depth {
            if let Some(&slot) = self.decoders.get(&id) {
                return Some(slot);
            }
            match self.aliases.get(&id) {
                Some(Some(next)) => id = next.clone(),
                _ => return None,
            }
        }
        None
    }
}

struct AliasCollector<'a> {
    decoders: &'a HashMap<Id, usize>,
    aliases: HashMap<Id, Option<Id>>,
}

impl AliasCollector<'_> {
    fn record(&mut self, binding: Id, target: Option<Id>) {
        // Decoders reassign themselves on first call; that is not aliasing.
        if self.decoders.contains_key(&binding) {
            return;
        }
        match self.aliases.get(&binding) {
            None => {
                self.aliases.insert(binding, target);
            }
            Some(existing) if *existing == target => {}
            Some(_) => {
                self.aliases.insert(binding, None);
            }
        }
    }
}

impl Visit for AliasCollector<'_> {
    fn visit_var_declarator(&mut self, n: &VarDeclarator) {
        if let Pat::Ident(binding) = &n.name {
            let target = n.init.as_deref().and_then(alias_target);
            // `var a;` without init adds nothing; a later assignment decides.
            if n.init.is_some() {
                self.record(binding.id.to_id(), target);
            }
        }
        n.visit_children_with(self);
    }

    fn visit_assign_expr(&mut self, n: &AssignExpr) {
        if let AssignTarget::Simple(SimpleAssignTarget::Ident(binding)) = &n.left {
            let target = if n.op == AssignOp::Assign {
                alias_target(&n.right)
            } else {
                None
            };
            self.record(binding.id.to_id(), target);
        }
        n.visit_children_with(self);
    }
}

fn alias_target(expr: &Expr) -> Option<Id> {
    match expr {
        Expr::Ident(i) => Some(i.to_id()),
        Expr::Paren(p) => alias_target(&p.expr),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Rewriter
// -----------------------------------------------------------------------------

/// A call site left untouched, reported once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCall {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RewritePass {
    pub rewritten: usize,
    pub skipped: Vec<SkippedCall>,
}

/// Keeps state across cycles so a site that failed once is neither retried
/// nor reported twice.
pub struct Rewriter<'a> {
    bindings: DecoderBindings,
    decoder: &'a dyn Decode,
    key_pattern: Regex,
    settled: HashSet<Span>,
    untouched: Vec<Span>,
}

impl<'a> Rewriter<'a> {
    pub fn new(bindings: DecoderBindings, decoder: &'a dyn Decode, key_pattern: Regex) -> Self {
        Self {
            bindings,
            decoder,
            key_pattern,
            settled: HashSet::new(),
            untouched: vec![],
        }
    }

    /// Leaves the call expression at `span` and everything inside it as
    /// written. The shuffle unit is kept this way: it has to keep seeing the
    /// decoders it rotates the table against.
    pub fn leave_untouched(mut self, span: Span) -> Self {
        self.untouched.push(span);
        self
    }

    /// One full traversal of `program`.
    pub fn run(&mut self, program: &mut Program) -> RewritePass {
        let mut visitor = CallSiteVisitor {
            rewriter: self,
            pass: RewritePass::default(),
        };
        program.visit_mut_with(&mut visitor);
        visitor.pass
    }
}

/// A call in decode shape: `callee(<number>, '<key>')`.
struct DecodeCall<'n> {
    callee: &'n Ident,
    index: f64,
    key: &'n str,
    hex_index: bool,
}

fn decode_call<'n>(call: &'n CallExpr, key_pattern: &Regex) -> Option<DecodeCall<'n>> {
    let callee = match &call.callee {
        Callee::Expr(e) => match &**e {
            Expr::Ident(i) => i,
            _ => return None,
        },
        _ => return None,
    };
    let [index, key] = call.args.as_slice() else {
        return None;
    };
    if index.spread.is_some() || key.spread.is_some() {
        return None;
    }
    let Expr::Lit(Lit::Num(index)) = &*index.expr else {
        return None;
    };
    let Expr::Lit(Lit::Str(key)) = &*key.expr else {
        return None;
    };
    let key: &str = &key.value;
    if !key_pattern.is_match(key) {
        return None;
    }
    let hex_index = index
        .raw
        .as_ref()
        .is_some_and(|raw| raw.starts_with("0x") || raw.starts_with("0X"));
    Some(DecodeCall {
        callee,
        index: index.value,
        key,
        hex_index,
    })
}

struct CallSiteVisitor<'r, 'a> {
    rewriter: &'r mut Rewriter<'a>,
    pass: RewritePass,
}

impl CallSiteVisitor<'_, '_> {
    fn skip(&mut self, span: Span, message: String) {
        if self.rewriter.settled.insert(span) {
            debug!(?span, %message, "skipped call site");
            self.pass.skipped.push(SkippedCall { span, message });
        }
    }

    /// Literal replacement for `call`, if it is a decode call that succeeds.
    fn try_decode(&mut self, call: &CallExpr) -> Option<String> {
        let site = decode_call(call, &self.rewriter.key_pattern)?;
        let span = call.span;
        if self.rewriter.settled.contains(&span) {
            return None;
        }
        let Some(slot) = self.rewriter.bindings.resolve(site.callee) else {
            // Plain two-argument calls are everywhere; only the obfuscator's
            // hex-indexed form counts as an unresolved decode call.
            if site.hex_index {
                self.skip(
                    span,
                    format!("callee `{}` does not resolve to a decoder", site.callee.sym),
                );
            }
            return None;
        };
        if !self.rewriter.decoder.is_available(slot) {
            debug!(slot, callee = %site.callee.sym, "decoder unavailable, leaving call");
            return None;
        }
        match self.rewriter.decoder.decode(slot, site.index, site.key) {
            Ok(value) => {
                debug!(slot, index = site.index, key = site.key, %value, "decoded call site");
                Some(value)
            }
            Err(err) => {
                self.skip(span, call_error_message(site.callee, &err));
                None
            }
        }
    }
}

fn call_error_message(callee: &Ident, err: &SandboxError) -> String {
    format!("call to `{}` failed: {err}", callee.sym)
}

impl VisitMut for CallSiteVisitor<'_, '_> {
    fn visit_mut_call_expr(&mut self, n: &mut CallExpr) {
        if self.rewriter.untouched.contains(&n.span) {
            return;
        }
        n.visit_mut_children_with(self);
    }

    fn visit_mut_expr(&mut self, n: &mut Expr) {
        n.visit_mut_children_with(self);

        let Expr::Call(call) = n else {
            return;
        };
        let span = call.span;
        if let Some(value) = self.try_decode(call) {
            *n = Expr::Lit(Lit::Str(Str {
                span,
                value: value.into(),
                raw: None,
            }));
            self.pass.rewritten += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use swc_core::common::Spanned;

    use super::*;
    use crate::tree::{with_globals, SourceTree};

    /// Decodes by joining index and key; slot 1 is unavailable, key "bad" throws.
    struct Stub {
        calls: Cell<usize>,
    }

    impl Decode for Stub {
        fn is_available(&self, slot: usize) -> bool {
            slot != 1
        }

        fn decode(&self, slot: usize, index: f64, key: &str) -> Result<String, SandboxError> {
            self.calls.set(self.calls.get() + 1);
            if key == "bad" {
                return Err(SandboxError::CallFailed("boom".to_string()));
            }
            Ok(format!("s{slot}:{index}:{key}"))
        }
    }

    fn decoder_ids(tree: &SourceTree, names: &[&str]) -> Vec<Id> {
        let Program::Script(script) = &tree.program else {
            panic!("expected a script");
        };
        names
            .iter()
            .map(|name| {
                script
                    .body
                    .iter()
                    .find_map(|stmt| match stmt {
                        Stmt::Decl(Decl::Fn(f)) if &*f.ident.sym == *name => Some(f.ident.to_id()),
                        _ => None,
                    })
                    .unwrap()
            })
            .collect()
    }

    fn rewrite(src: &str, names: &[&str]) -> (String, RewritePass, usize) {
        with_globals(|| {
            let mut tree = SourceTree::parse("input.js", src).unwrap();
            let ids = decoder_ids(&tree, names);
            let bindings = DecoderBindings::collect(&tree.program, &ids, 8);
            let stub = Stub { calls: Cell::new(0) };
            let mut rewriter = Rewriter::new(bindings, &stub, Regex::new(r"^[\s\S]{1,16}$").unwrap());
            let pass = rewriter.run(&mut tree.program);
            (tree.emit(), pass, stub.calls.get())
        })
    }

    #[test]
    fn rewrites_direct_and_aliased_calls() {
        let (out, pass, _) = rewrite(
            "function dec(i, k) {}\nfunction f() { var a = dec; var b = a; return dec(0x1, 'x') + b(0x2, 'y'); }",
            &["dec"],
        );
        assert_eq!(pass.rewritten, 2);
        assert!(pass.skipped.is_empty());
        assert!(out.contains(r#""s0:1:x" + "s0:2:y""#), "{out}");
    }

    #[test]
    fn each_decoder_resolves_only_its_own_calls() {
        let (out, pass, _) = rewrite(
            "function d0(i, k) {}\nfunction d2(i, k) {}\nfunction d1(i, k) {}\nd0(0x1, 'a'); d2(0x2, 'b');",
            &["d0", "d1", "d2"],
        );
        assert_eq!(pass.rewritten, 2);
        assert!(out.contains(r#""s0:1:a""#), "{out}");
        assert!(out.contains(r#""s2:2:b""#), "{out}");
    }

    #[test]
    fn shadowed_name_is_skipped_not_rewritten() {
        let (out, pass, calls) = rewrite(
            "function dec(i, k) {}\nfunction run(dec) { return dec(0x5, 'k'); }",
            &["dec"],
        );
        assert_eq!(pass.rewritten, 0);
        assert_eq!(calls, 0);
        assert_eq!(pass.skipped.len(), 1);
        assert!(pass.skipped[0].message.contains("does not resolve"));
        assert!(out.contains("dec(0x5, 'k')"), "{out}");
    }

    #[test]
    fn reassigned_alias_does_not_resolve() {
        let (_, pass, _) = rewrite(
            "function dec(i, k) {}\nfunction other() {}\nvar a = dec; a = other; a(0x1, 'k');",
            &["dec"],
        );
        assert_eq!(pass.rewritten, 0);
        assert_eq!(pass.skipped.len(), 1);
    }

    #[test]
    fn alias_chain_longer_than_limit_does_not_resolve() {
        with_globals(|| {
            let mut tree = SourceTree::parse(
                "input.js",
                "function dec(i, k) {}\nvar a = dec; var b = a; var c = b; c(0x1, 'k');",
            )
            .unwrap();
            let ids = decoder_ids(&tree, &["dec"]);
            let stub = Stub { calls: Cell::new(0) };
            let bindings = DecoderBindings::collect(&tree.program, &ids, 2);
            let mut rewriter = Rewriter::new(bindings, &stub, Regex::new(".+").unwrap());
            assert_eq!(rewriter.run(&mut tree.program).rewritten, 0);

            let bindings = DecoderBindings::collect(&tree.program, &ids, 3);
            let mut rewriter = Rewriter::new(bindings, &stub, Regex::new(".+").unwrap());
            assert_eq!(rewriter.run(&mut tree.program).rewritten, 1);
        });
    }

    #[test]
    fn shape_mismatches_are_ignored() {
        let (_, pass, calls) = rewrite(
            "function dec(i, k) {}\ndec(0x1); dec(0x1, 'k', 3); dec('x', 'k'); dec(0x1, k); dec(...xs, 'k'); foo(1, 'k');",
            &["dec"],
        );
        assert_eq!(pass.rewritten, 0);
        assert!(pass.skipped.is_empty());
        assert_eq!(calls, 0);
    }

    #[test]
    fn key_pattern_gates_call_sites() {
        with_globals(|| {
            let mut tree =
                SourceTree::parse("input.js", "function dec(i, k) {}\ndec(0x1, 'ab'); dec(0x2, 'abcd');")
                    .unwrap();
            let ids = decoder_ids(&tree, &["dec"]);
            let stub = Stub { calls: Cell::new(0) };
            let bindings = DecoderBindings::collect(&tree.program, &ids, 8);
            let mut rewriter = Rewriter::new(bindings, &stub, Regex::new("^[a-z]{4}$").unwrap());
            let pass = rewriter.run(&mut tree.program);
            assert_eq!(pass.rewritten, 1);
            assert!(tree.emit().contains("dec(0x1, 'ab')"));
        });
    }

    #[test]
    fn failing_call_is_reported_once_across_passes() {
        with_globals(|| {
            let mut tree =
                SourceTree::parse("input.js", "function dec(i, k) {}\ndec(0x1, 'bad');").unwrap();
            let ids = decoder_ids(&tree, &["dec"]);
            let stub = Stub { calls: Cell::new(0) };
            let bindings = DecoderBindings::collect(&tree.program, &ids, 8);
            let mut rewriter = Rewriter::new(bindings, &stub, Regex::new(".+").unwrap());
            let first = rewriter.run(&mut tree.program);
            let second = rewriter.run(&mut tree.program);
            assert_eq!(first.skipped.len(), 1);
            assert!(first.skipped[0].message.contains("boom"));
            assert!(second.skipped.is_empty());
            assert_eq!(stub.calls.get(), 1);
            assert!(tree.emit().contains("dec(0x1, 'bad')"));
        });
    }

    #[test]
    fn unavailable_decoder_is_left_without_report() {
        let (out, pass, calls) = rewrite(
            "function d0(i, k) {}\nfunction d1(i, k) {}\nd1(0x1, 'k');",
            &["d0", "d1"],
        );
        assert_eq!(pass.rewritten, 0);
        assert!(pass.skipped.is_empty());
        assert_eq!(calls, 0);
        assert!(out.contains("d1(0x1, 'k')"));
    }

    #[test]
    fn replacement_keeps_surrounding_nodes() {
        let (out, pass, _) = rewrite(
            "function dec(i, k) {}\nconsole[dec(0x1, 'a')](dec(0x2, 'b'), other(0x3, 'c'));",
            &["dec"],
        );
        assert_eq!(pass.rewritten, 2);
        assert!(out.contains(r#"console["s0:1:a"]("s0:2:b", other(0x3, 'c'))"#), "{out}");
    }

    #[test]
    fn untouched_call_keeps_decode_calls_inside_it() {
        with_globals(|| {
            let mut tree = SourceTree::parse(
                "input.js",
                "function dec(i, k) {}\n(function () { return dec(0x1, 'a'); }());\ndec(0x2, 'b');",
            )
            .unwrap();
            let Program::Script(script) = &tree.program else {
                panic!("expected a script");
            };
            let Stmt::Expr(stmt) = &script.body[1] else {
                panic!("expected the IIFE statement");
            };
            let Expr::Paren(ParenExpr { expr, .. }) = &*stmt.expr else {
                panic!("expected a parenthesized IIFE");
            };
            let iife = expr.span();

            let ids = decoder_ids(&tree, &["dec"]);
            let stub = Stub { calls: Cell::new(0) };
            let bindings = DecoderBindings::collect(&tree.program, &ids, 8);
            let mut rewriter =
                Rewriter::new(bindings, &stub, Regex::new(".+").unwrap()).leave_untouched(iife);
            let pass = rewriter.run(&mut tree.program);
            assert_eq!(pass.rewritten, 1);
            assert!(pass.skipped.is_empty());
            assert_eq!(stub.calls.get(), 1);

            let out = tree.emit();
            assert!(out.contains("return dec(0x1, 'a');"), "{out}");
            assert!(out.contains(r#""s0:2:b";"#), "{out}");
        });
    }
}
