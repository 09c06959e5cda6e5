//! Constant folding: string concatenation and pure numeric arithmetic.
//!
//! Both rules rewrite bottom-up, so a single traversal already collapses
//! nested chains like `"a" + "b" + "c"`. Literals that are already in their
//! simplest form (`7`, `-7`) are never rewritten, which is what lets the
//! fixed-point loop stop.

use swc_core::{
    common::{Span, DUMMY_SP},
    ecma::{
        ast::*,
        visit::{VisitMut, VisitMutWith},
    },
};
use tracing::debug;

/// `"a" + "b"` → `"ab"`. Never touches mixed string/number operands.
#[derive(Default)]
pub struct StringConcatFold {
    pub changed: usize,
}

impl VisitMut for StringConcatFold {
    fn visit_mut_expr(&mut self, n: &mut Expr) {
        n.visit_mut_children_with(self);

        let Expr::Bin(bin) = n else {
            return;
        };
        if bin.op != BinaryOp::Add {
            return;
        }
        let (Some(left), Some(right)) = (string_operand(&bin.left), string_operand(&bin.right))
        else {
            return;
        };
        let value = format!("{left}{right}");
        let span = bin.span;
        *n = Expr::Lit(Lit::Str(Str {
            span,
            value: value.into(),
            raw: None,
        }));
        self.changed += 1;
    }
}

fn string_operand(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Lit(Lit::Str(s)) => Some(&*s.value),
        Expr::Paren(p) => string_operand(&p.expr),
        _ => None,
    }
}

/// Collapses any subtree of numeric literals, `+ - * /` and unary minus to
/// one literal. Results that are not finite are left as written.
#[derive(Default)]
pub struct NumericFold {
    pub changed: usize,
}

impl VisitMut for NumericFold {
    fn visit_mut_expr(&mut self, n: &mut Expr) {
        n.visit_mut_children_with(self);

        let span = match n {
            Expr::Bin(b) => b.span,
            Expr::Unary(u) => u.span,
            // Parens stay so member access like `(1 - 2).toFixed()` keeps parsing.
            _ => return,
        };
        if is_simplest(n) {
            return;
        }
        let Some(value) = eval_numeric(n) else {
            return;
        };
        if !value.is_finite() {
            return;
        }
        *n = numeric_literal(value, span);
        self.changed += 1;
    }
}

/// `7` or `-7`: already folded, never revisited.
fn is_simplest(expr: &Expr) -> bool {
    match expr {
        Expr::Lit(Lit::Num(_)) => true,
        Expr::Unary(UnaryExpr {
            op: UnaryOp::Minus,
            arg,
            ..
        }) => matches!(&**arg, Expr::Lit(Lit::Num(_))),
        _ => false,
    }
}

fn eval_numeric(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Lit(Lit::Num(n)) => Some(n.value),
        Expr::Paren(p) => eval_numeric(&p.expr),
        Expr::Unary(UnaryExpr {
            op: UnaryOp::Minus,
            arg,
            ..
        }) => eval_numeric(arg).map(|v| -v),
        Expr::Bin(bin) => {
            let l = eval_numeric(&bin.left)?;
            let r = eval_numeric(&bin.right)?;
            match bin.op {
                BinaryOp::Add => Some(l + r),
                BinaryOp::Sub => Some(l - r),
                BinaryOp::Mul => Some(l * r),
                BinaryOp::Div => Some(l / r),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Negative values (and `-0`) print as unary minus over a positive literal.
fn numeric_literal(value: f64, span: Span) -> Expr {
    let num = |value: f64, span: Span| {
        Expr::Lit(Lit::Num(Number {
            span,
            value,
            raw: None,
        }))
    };
    if value.is_sign_negative() {
        Expr::Unary(UnaryExpr {
            span,
            op: UnaryOp::Minus,
            arg: Box::new(num(-value, DUMMY_SP)),
        })
    } else {
        num(value, span)
    }
}

/// Runs both rules until neither changes anything, at most `max_passes`
/// times. Returns the number of nodes rewritten.
pub fn fold_to_fixed_point(program: &mut Program, max_passes: usize) -> usize {
    let mut total = 0;
    for pass in 0..max_passes {
        let mut strings = StringConcatFold::default();
        program.visit_mut_with(&mut strings);
        let mut numbers = NumericFold::default();
        program.visit_mut_with(&mut numbers);

        let changed = strings.changed + numbers.changed;
        debug!(pass, strings = strings.changed, numbers = numbers.changed, "fold pass");
        if changed == 0 {
            break;
        }
        total += changed;
    }
    total
}
