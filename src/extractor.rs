use swc_core::{
    common::{sync::Lrc, SourceMap, SyntaxContext, DUMMY_SP},
    ecma::{
        ast::*,
        visit::{VisitMut, VisitMutWith},
    },
};

use crate::locator::LocatorResult;
use crate::tree::emit_program;

/// Prefix of the synthetic bindings that expose each decoder to the host.
pub const EXPORT_PREFIX: &str = "__deob_decoder_";

/// Host function called at the top of every loop body and function body of
/// the unit. The sandbox uses it to stop a worker it has given up on.
pub const CHECKPOINT: &str = "__deob_checkpoint";

/// The minimal, self-contained program the sandbox evaluates.
#[derive(Debug, Clone)]
pub struct ExtractedUnit {
    pub source: String,
    /// Export name per decoder slot.
    pub exports: Vec<String>,
    /// Binding of the decoder behind each slot, for call-site resolution.
    pub decoder_ids: Vec<Id>,
}

enum Piece<'a> {
    Function(&'a FnDecl),
    Invocation(&'a CallExpr),
}

/// Builds the unit: helpers in original source order, then one
/// `var __deob_decoder_N = decoder;` per decoder. Every loop body and
/// function body gets a leading [`CHECKPOINT`] call.
///
/// The shuffle IIFE mutates the table the decoders read, so it has to run
/// before any decoder is first called. Keeping source order guarantees that.
pub fn extract(found: &LocatorResult, cm: &Lrc<SourceMap>) -> ExtractedUnit {
    let mut pieces: Vec<Piece<'_>> = Vec::with_capacity(found.decoders.len() + 2);
    pieces.push(Piece::Function(&found.string_table));
    pieces.push(Piece::Invocation(&found.shuffle_unit));
    pieces.extend(found.decoders.iter().map(Piece::Function));
    pieces.sort_by_key(|p| match p {
        Piece::Function(f) => f.function.span.lo(),
        Piece::Invocation(c) => c.span.lo(),
    });

    let mut body: Vec<Stmt> = pieces
        .into_iter()
        .map(|piece| match piece {
            Piece::Function(f) => Stmt::Decl(Decl::Fn(f.clone())),
            // Parenthesized so the printer never emits a bare `function` statement.
            Piece::Invocation(c) => Stmt::Expr(ExprStmt {
                span: DUMMY_SP,
                expr: Box::new(Expr::Paren(ParenExpr {
                    span: DUMMY_SP,
                    expr: Box::new(Expr::Call(c.clone())),
                })),
            }),
        })
        .collect();

    let mut exports = Vec::with_capacity(found.decoders.len());
    let mut decoder_ids = Vec::with_capacity(found.decoders.len());
    for (slot, decoder) in found.decoders.iter().enumerate() {
        let name = format!("{EXPORT_PREFIX}{slot}");
        body.push(export_stmt(&name, &decoder.ident));
        exports.push(name);
        decoder_ids.push(decoder.ident.to_id());
    }

    let mut program = Program::Script(Script {
        span: DUMMY_SP,
        body,
        shebang: None,
    });
    program.visit_mut_with(&mut Checkpoints);
    ExtractedUnit {
        source: emit_program(cm, &program),
        exports,
        decoder_ids,
    }
}

fn export_stmt(name: &str, decoder: &Ident) -> Stmt {
    Stmt::Decl(Decl::Var(Box::new(VarDecl {
        span: DUMMY_SP,
        ctxt: SyntaxContext::empty(),
        kind: VarDeclKind::Var,
        declare: false,
        decls: vec![VarDeclarator {
            span: DUMMY_SP,
            name: Pat::Ident(BindingIdent {
                id: Ident::new(name.into(), DUMMY_SP, SyntaxContext::empty()),
                type_ann: None,
            }),
            init: Some(Box::new(Expr::Ident(decoder.clone()))),
            definite: false,
        }],
    })))
}

/// Plants a [`CHECKPOINT`] call wherever the unit can spin.
struct Checkpoints;

impl VisitMut for Checkpoints {
    fn visit_mut_function(&mut self, n: &mut Function) {
        n.visit_mut_children_with(self);
        if let Some(body) = &mut n.body {
            // Directives have to stay first.
            let at = body
                .stmts
                .iter()
                .take_while(|s| matches!(s, Stmt::Expr(e) if e.expr.is_lit()))
                .count();
            body.stmts.insert(at, checkpoint_stmt());
        }
    }

    fn visit_mut_arrow_expr(&mut self, n: &mut ArrowExpr) {
        n.visit_mut_children_with(self);
        match &mut *n.body {
            BlockStmtOrExpr::BlockStmt(block) => block.stmts.insert(0, checkpoint_stmt()),
            BlockStmtOrExpr::Expr(expr) => {
                let invalid = Box::new(Expr::Invalid(Invalid { span: DUMMY_SP }));
                let arg = std::mem::replace(expr, invalid);
                *n.body = BlockStmtOrExpr::BlockStmt(block(vec![
                    checkpoint_stmt(),
                    Stmt::Return(ReturnStmt {
                        span: DUMMY_SP,
                        arg: Some(arg),
                    }),
                ]));
            }
        }
    }

    fn visit_mut_while_stmt(&mut self, n: &mut WhileStmt) {
        n.visit_mut_children_with(self);
        guard(&mut n.body);
    }

    fn visit_mut_do_while_stmt(&mut self, n: &mut DoWhileStmt) {
        n.visit_mut_children_with(self);
        guard(&mut n.body);
    }

    fn visit_mut_for_stmt(&mut self, n: &mut ForStmt) {
        n.visit_mut_children_with(self);
        guard(&mut n.body);
    }

    fn visit_mut_for_in_stmt(&mut self, n: &mut ForInStmt) {
        n.visit_mut_children_with(self);
        guard(&mut n.body);
    }

    fn visit_mut_for_of_stmt(&mut self, n: &mut ForOfStmt) {
        n.visit_mut_children_with(self);
        guard(&mut n.body);
    }
}

fn guard(body: &mut Box<Stmt>) {
    match &mut **body {
        Stmt::Block(b) => b.stmts.insert(0, checkpoint_stmt()),
        other => {
            let stmt = std::mem::replace(other, Stmt::Empty(EmptyStmt { span: DUMMY_SP }));
            *other = Stmt::Block(block(vec![checkpoint_stmt(), stmt]));
        }
    }
}

fn block(stmts: Vec<Stmt>) -> BlockStmt {
    BlockStmt {
        span: DUMMY_SP,
        stmts,
        ctxt: SyntaxContext::empty(),
    }
}

fn checkpoint_stmt() -> Stmt {
    Stmt::Expr(ExprStmt {
        span: DUMMY_SP,
        expr: Box::new(Expr::Call(CallExpr {
            span: DUMMY_SP,
            callee: Callee::Expr(Box::new(Expr::Ident(Ident::new(
                CHECKPOINT.into(),
                DUMMY_SP,
                SyntaxContext::empty(),
            )))),
            args: vec![],
            type_args: None,
            ctxt: SyntaxContext::empty(),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use crate::locator::{Locator, PatternTable};
    use crate::tree::{with_globals, SourceTree};

    fn extract_src(src: &str) -> ExtractedUnit {
        with_globals(|| {
            let tree = SourceTree::parse("input.js", src).unwrap();
            let table = PatternTable::default();
            let config = PatternConfig::default();
            let found = Locator::new(&table, &config).locate(&tree.program).unwrap();
            extract(&found, tree.source_map())
        })
    }

    const SRC: &str = r#"
var unrelated = 1;
function dec(i, k) { var t = tbl(); return t[i]; }
function tbl() { var a = ['x', 'y']; tbl = function () { return a; }; return tbl(); }
console.log('noise');
(function (get, target) {
    var arr = get();
    while (!![]) {
        try { if (dec(0x0, 'k') === target) break; else arr.push(arr.shift()); }
        catch (e) { arr.push(arr.shift()); }
    }
}(tbl, 'y'));
function dec2(i, k) { var t = tbl(); return t[i + 1]; }
"#;

    #[test]
    fn keeps_source_order_and_drops_everything_else() {
        let unit = extract_src(SRC);
        let dec = unit.source.find("function dec(").unwrap();
        let tbl = unit.source.find("function tbl(").unwrap();
        let shuffle = unit.source.find("while").unwrap();
        let dec2 = unit.source.find("function dec2(").unwrap();
        assert!(dec < tbl && tbl < shuffle && shuffle < dec2);
        assert!(!unit.source.contains("unrelated"));
        assert!(!unit.source.contains("noise"));
    }

    #[test]
    fn exports_each_decoder_after_the_helpers() {
        let unit = extract_src(SRC);
        assert_eq!(unit.exports, vec!["__deob_decoder_0", "__deob_decoder_1"]);
        assert_eq!(unit.decoder_ids.len(), 2);
        let shuffle = unit.source.find("while").unwrap();
        let export0 = unit.source.find("var __deob_decoder_0 = dec;").unwrap();
        let export1 = unit.source.find("var __deob_decoder_1 = dec2;").unwrap();
        assert!(shuffle < export0 && export0 < export1);
    }

    fn squashed(source: &str) -> String {
        source.split_whitespace().collect()
    }

    #[test]
    fn loops_and_functions_start_with_a_checkpoint() {
        let unit = extract_src(SRC);
        let code = squashed(&unit.source);
        assert!(code.contains("while(!![]){__deob_checkpoint();try{"), "{}", unit.source);
        assert!(code.contains("functiondec(i,k){__deob_checkpoint();vart=tbl();"), "{}", unit.source);
        // dec, tbl, its inner function, the shuffle IIFE, dec2 and the loop
        assert_eq!(unit.source.matches("__deob_checkpoint();").count(), 6);
        // the export statements stay bare
        assert!(code.ends_with("var__deob_decoder_0=dec;var__deob_decoder_1=dec2;"));
    }

    #[test]
    fn bare_loop_bodies_and_arrow_bodies_are_wrapped() {
        let unit = extract_src(
            r#"
function tbl() { var a = ['x', 'y']; tbl = function () { return a; }; return tbl(); }
function dec(i, k) {
    var t = tbl();
    var at = (n) => t[n];
    for (var j = 0; j < 2; j++) i++;
    return at(i);
}
(function (get, target) {
    var arr = get();
    while (!![]) {
        try { if (dec(0x0, 'k') === target) break; else arr.push(arr.shift()); }
        catch (e) { arr.push(arr.shift()); }
    }
}(tbl, 'x'));
"#,
        );
        let code = squashed(&unit.source);
        assert!(code.contains("j++){__deob_checkpoint();i++;}"), "{}", unit.source);
        assert!(code.contains("=>{__deob_checkpoint();returnt[n];}"), "{}", unit.source);
        // tbl, its inner function, dec, the arrow, the IIFE and both loops
        assert_eq!(unit.source.matches("__deob_checkpoint();").count(), 7);
    }

    #[test]
    fn extracted_unit_parses_on_its_own() {
        let unit = extract_src(SRC);
        with_globals(|| {
            assert!(SourceTree::parse("unit.js", &unit.source).is_ok());
        });
    }
}
